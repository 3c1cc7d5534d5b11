//! # Yeelight Control Library
//!
//! `yeelight-control-lib` is a Rust library for controlling Yeelight-compatible smart
//! bulbs over the local network. It finds bulbs with the multicast search protocol
//! (falling back to a scan of the local subnet) and drives them through their
//! line-delimited JSON command interface.
//!
//! ## Features
//!
//! - Device discovery via multicast search, with a TCP port scan fallback
//! - A command client with correlated, concurrent requests and per-command timeouts
//! - Automatic reconnection and keepalive pings
//! - Typed helpers for power, color, color temperature, flows, scenes and timers
//!
//! ## Example
//!
//! Discover a bulb and toggle it:
//!
//! ```no_run
//! use yeelight_control_lib::control_interface::Yeelight;
//! use yeelight_control_lib::util::discovery::Discovery;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = Discovery::find_devices(Duration::from_secs(3)).await?;
//!
//!     for device in devices {
//!         let light = Yeelight::from_device(&device);
//!         light.connect().await?;
//!         light.toggle().await?;
//!         light.disconnect().await;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `control_interface` module holds the command client: the connection
// lifecycle, correlation of responses to requests and the typed command helpers.
//
// Example usage:
//
// ```
// use yeelight_control_lib::control_interface::{ClientConfig, Yeelight};
//
// #[tokio::main]
// async fn main() {
//     let light = Yeelight::new(ClientConfig::new("192.168.1.20"));
//     light.connect().await.unwrap();
//     light.set_name("desk").await.unwrap();
// }
// ```
pub mod control_interface;

pub mod error;

// The `led` module contains the value types sent to a bulb: RGB colors,
// color flow states and scenes.
//
// Example usage:
//
// ```
// use yeelight_control_lib::led::color::Color;
// use yeelight_control_lib::led::flow::{FlowMode, FlowState};
//
// let state = FlowState::new(500, FlowMode::Color, Color::new(255, 0, 0).value(), 100);
// ```
pub mod led;

// The `util` module provides discovery, the wire codec and the device model.
//
// Example usage:
//
// ```
// use yeelight_control_lib::util::discovery::Discovery;
// use std::time::Duration;
//
// #[tokio::main]
// async fn main() {
//     let devices = Discovery::find_devices(Duration::from_secs(5)).await.unwrap();
//     for device in devices {
//         println!("Found device: {}", device);
//     }
// }
// ```
pub mod util;

pub use error::{Error, Result};
