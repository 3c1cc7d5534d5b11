pub mod codec;
pub mod device;
pub mod discovery;
pub mod ip_scan;
pub mod registry;
