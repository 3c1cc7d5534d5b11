pub mod color;
pub mod flow;
pub mod scene;
