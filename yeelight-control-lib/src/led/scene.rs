use serde_json::{json, Value};

use crate::led::color::Color;
use crate::led::flow::{flow_expression, FlowState, StartFlowAction};

/// A target state applied in one step with `set_scene`.
///
/// If the bulb is off it is turned on first.
#[derive(Debug, Clone, PartialEq)]
pub enum Scene {
    Color { color: Color, brightness: u8 },
    Hsv { hue: u16, sat: u8, brightness: u8 },
    Ct { kelvin: u32, brightness: u8 },
    ColorFlow {
        repeat: u32,
        action: StartFlowAction,
        states: Vec<FlowState>,
    },
    /// Turn on at `brightness` and switch off after `minutes`.
    AutoDelayOff { brightness: u8, minutes: u32 },
}

impl Scene {
    pub fn kind(&self) -> &'static str {
        match self {
            Scene::Color { .. } => "color",
            Scene::Hsv { .. } => "hsv",
            Scene::Ct { .. } => "ct",
            Scene::ColorFlow { .. } => "cf",
            Scene::AutoDelayOff { .. } => "auto_delay_off",
        }
    }

    pub fn params(&self) -> Vec<Value> {
        let kind = json!(self.kind());
        match self {
            Scene::Color { color, brightness } => vec![kind, json!(color.value()), json!(brightness)],
            Scene::Hsv {
                hue,
                sat,
                brightness,
            } => vec![kind, json!(hue), json!(sat), json!(brightness)],
            Scene::Ct { kelvin, brightness } => vec![kind, json!(kelvin), json!(brightness)],
            Scene::ColorFlow {
                repeat,
                action,
                states,
            } => vec![
                kind,
                json!(repeat),
                json!(*action as u8),
                json!(flow_expression(states)),
            ],
            Scene::AutoDelayOff {
                brightness,
                minutes,
            } => vec![kind, json!(brightness), json!(minutes)],
        }
    }
}
