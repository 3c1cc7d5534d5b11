use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::led::color::Color;
use crate::led::flow::{flow_expression, FlowState, StartFlowAction};
use crate::led::scene::Scene;

/// Default duration of a smooth transition, in milliseconds.
pub const DEFAULT_DURATION_MS: u64 = 500;

/// Method name the device uses for unsolicited property pushes.
pub const PROPS_METHOD: &str = "props";

/// Error code devices answer with when they do not know a method.
pub const METHOD_NOT_SUPPORTED_CODE: i64 = -1;

/// The methods understood by the bulb's LAN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "set_power")]
    SetPower,
    #[serde(rename = "toggle")]
    Toggle,
    #[serde(rename = "set_default")]
    SetDefault,
    #[serde(rename = "start_cf")]
    StartColorFlow,
    #[serde(rename = "stop_cf")]
    StopColorFlow,
    #[serde(rename = "get_prop")]
    GetProp,
    #[serde(rename = "set_scene")]
    SetScene,
    #[serde(rename = "set_ct_abx")]
    SetCtAbx,
    #[serde(rename = "set_rgb")]
    SetRgb,
    #[serde(rename = "set_hsv")]
    SetHsv,
    #[serde(rename = "set_bright")]
    SetBright,
    #[serde(rename = "cron_add")]
    CronAdd,
    #[serde(rename = "cron_get")]
    CronGet,
    #[serde(rename = "cron_del")]
    CronDelete,
    #[serde(rename = "set_adjust")]
    SetAdjust,
    #[serde(rename = "set_music")]
    SetMusic,
    #[serde(rename = "set_name")]
    SetName,
    #[serde(rename = "adjust_bright")]
    AdjustBright,
    #[serde(rename = "adjust_ct")]
    AdjustCt,
    #[serde(rename = "adjust_color")]
    AdjustColor,
    #[serde(rename = "ping")]
    Ping,
}

impl Method {
    pub const ALL: [Method; 21] = [
        Method::SetPower,
        Method::Toggle,
        Method::SetDefault,
        Method::StartColorFlow,
        Method::StopColorFlow,
        Method::GetProp,
        Method::SetScene,
        Method::SetCtAbx,
        Method::SetRgb,
        Method::SetHsv,
        Method::SetBright,
        Method::CronAdd,
        Method::CronGet,
        Method::CronDelete,
        Method::SetAdjust,
        Method::SetMusic,
        Method::SetName,
        Method::AdjustBright,
        Method::AdjustCt,
        Method::AdjustColor,
        Method::Ping,
    ];

    /// The wire name, e.g. `"start_cf"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SetPower => "set_power",
            Method::Toggle => "toggle",
            Method::SetDefault => "set_default",
            Method::StartColorFlow => "start_cf",
            Method::StopColorFlow => "stop_cf",
            Method::GetProp => "get_prop",
            Method::SetScene => "set_scene",
            Method::SetCtAbx => "set_ct_abx",
            Method::SetRgb => "set_rgb",
            Method::SetHsv => "set_hsv",
            Method::SetBright => "set_bright",
            Method::CronAdd => "cron_add",
            Method::CronGet => "cron_get",
            Method::CronDelete => "cron_del",
            Method::SetAdjust => "set_adjust",
            Method::SetMusic => "set_music",
            Method::SetName => "set_name",
            Method::AdjustBright => "adjust_bright",
            Method::AdjustCt => "adjust_ct",
            Method::AdjustColor => "adjust_color",
            Method::Ping => "ping",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown method: {}", s))
    }
}

/// Transition style for state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Change gradually over the given duration.
    Smooth,
    /// Jump straight to the target; the duration is ignored by the device.
    Sudden,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Smooth => "smooth",
            Effect::Sudden => "sudden",
        }
    }
}

/// Direction for `set_adjust`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustAction {
    Increase,
    Decrease,
    /// Increase, wrapping back to the minimum after the maximum.
    Circle,
}

impl AdjustAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustAction::Increase => "increase",
            AdjustAction::Decrease => "decrease",
            AdjustAction::Circle => "circle",
        }
    }
}

/// Property targeted by `set_adjust` and the `adjust_*` methods.
///
/// When adjusting `Color` with `set_adjust` the device only accepts
/// [`AdjustAction::Circle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustProperty {
    Bright,
    Ct,
    Color,
}

impl AdjustProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustProperty::Bright => "bright",
            AdjustProperty::Ct => "ct",
            AdjustProperty::Color => "color",
        }
    }

    /// The percentage-based `adjust_*` method for this property.
    pub fn adjust_method(&self) -> Method {
        match self {
            AdjustProperty::Bright => Method::AdjustBright,
            AdjustProperty::Ct => Method::AdjustCt,
            AdjustProperty::Color => Method::AdjustColor,
        }
    }
}

/// Properties that can be read with `get_prop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProperty {
    Power,
    Bright,
    Ct,
    Rgb,
    Hue,
    Sat,
    ColorMode,
    Flowing,
    Delayoff,
    FlowParams,
    MusicOn,
    Name,
    BgPower,
    BgFlowing,
    BgFlowParams,
    BgCt,
    BgLmode,
    BgBright,
    BgHue,
    BgSat,
    BgRgb,
    NlBr,
    ActiveMode,
}

impl DeviceProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceProperty::Power => "power",
            DeviceProperty::Bright => "bright",
            DeviceProperty::Ct => "ct",
            DeviceProperty::Rgb => "rgb",
            DeviceProperty::Hue => "hue",
            DeviceProperty::Sat => "sat",
            DeviceProperty::ColorMode => "color_mode",
            DeviceProperty::Flowing => "flowing",
            DeviceProperty::Delayoff => "delayoff",
            DeviceProperty::FlowParams => "flow_params",
            DeviceProperty::MusicOn => "music_on",
            DeviceProperty::Name => "name",
            DeviceProperty::BgPower => "bg_power",
            DeviceProperty::BgFlowing => "bg_flowing",
            DeviceProperty::BgFlowParams => "bg_flow_params",
            DeviceProperty::BgCt => "bg_ct",
            DeviceProperty::BgLmode => "bg_lmode",
            DeviceProperty::BgBright => "bg_bright",
            DeviceProperty::BgHue => "bg_hue",
            DeviceProperty::BgSat => "bg_sat",
            DeviceProperty::BgRgb => "bg_rgb",
            DeviceProperty::NlBr => "nl_br",
            DeviceProperty::ActiveMode => "active_mode",
        }
    }
}

/// A request sent to the device.
///
/// The id stays `None` until the client assigns one at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: Method,
    pub params: Vec<Value>,
}

impl Command {
    pub fn new(method: Method, params: Vec<Value>) -> Self {
        Command {
            id: None,
            method,
            params,
        }
    }

    pub fn set_power(turn_on: bool, effect: Effect, duration_ms: u64) -> Self {
        let power = if turn_on { "on" } else { "off" };
        Command::new(
            Method::SetPower,
            vec![json!(power), json!(effect.as_str()), json!(duration_ms)],
        )
    }

    pub fn toggle() -> Self {
        Command::new(Method::Toggle, Vec::new())
    }

    pub fn set_default() -> Self {
        Command::new(Method::SetDefault, Vec::new())
    }

    /// `repeat` is the number of state changes before the flow stops, 0 loops forever.
    pub fn start_color_flow(states: &[FlowState], action: StartFlowAction, repeat: u32) -> Self {
        Command::new(
            Method::StartColorFlow,
            vec![
                json!(repeat),
                json!(action as u8),
                json!(flow_expression(states)),
            ],
        )
    }

    pub fn stop_color_flow() -> Self {
        Command::new(Method::StopColorFlow, Vec::new())
    }

    pub fn set_scene(scene: &Scene) -> Self {
        Command::new(Method::SetScene, scene.params())
    }

    pub fn get_property(properties: &[DeviceProperty]) -> Self {
        Command::new(
            Method::GetProp,
            properties.iter().map(|p| json!(p.as_str())).collect(),
        )
    }

    /// `ct` is the target color temperature in kelvin (1700 to 6500).
    pub fn set_ct_abx(ct: u32, effect: Effect, duration_ms: u64) -> Self {
        Command::new(
            Method::SetCtAbx,
            vec![json!(ct), json!(effect.as_str()), json!(duration_ms)],
        )
    }

    pub fn set_rgb(color: &Color, effect: Effect, duration_ms: u64) -> Self {
        Command::new(
            Method::SetRgb,
            vec![
                json!(color.value()),
                json!(effect.as_str()),
                json!(duration_ms),
            ],
        )
    }

    pub fn set_hsv(hue: u16, sat: u8, effect: Effect, duration_ms: u64) -> Self {
        Command::new(
            Method::SetHsv,
            vec![
                json!(hue),
                json!(sat),
                json!(effect.as_str()),
                json!(duration_ms),
            ],
        )
    }

    /// `brightness` is a percentage, 1 to 100.
    pub fn set_bright(brightness: u8, effect: Effect, duration_ms: u64) -> Self {
        Command::new(
            Method::SetBright,
            vec![json!(brightness), json!(effect.as_str()), json!(duration_ms)],
        )
    }

    /// Starts a timer job; type 0 (power off) is the only type devices know.
    pub fn cron_add(cron_type: u32, minutes: u32) -> Self {
        Command::new(Method::CronAdd, vec![json!(cron_type), json!(minutes)])
    }

    pub fn cron_get(cron_type: u32) -> Self {
        Command::new(Method::CronGet, vec![json!(cron_type)])
    }

    pub fn cron_delete(cron_type: u32) -> Self {
        Command::new(Method::CronDelete, vec![json!(cron_type)])
    }

    pub fn set_adjust(action: AdjustAction, property: AdjustProperty) -> Self {
        Command::new(
            Method::SetAdjust,
            vec![json!(action.as_str()), json!(property.as_str())],
        )
    }

    /// Points the device at a music server, or stops music mode when `on` is false.
    pub fn set_music(on: bool, host: &str, port: u16) -> Self {
        let params = if on {
            vec![json!(1), json!(host), json!(port)]
        } else {
            vec![json!(0)]
        };
        Command::new(Method::SetMusic, params)
    }

    pub fn set_name(name: &str) -> Self {
        Command::new(Method::SetName, vec![json!(name)])
    }

    /// `percentage` ranges from -100 to 100.
    pub fn adjust(property: AdjustProperty, percentage: i8, duration_ms: u64) -> Self {
        Command::new(
            property.adjust_method(),
            vec![json!(percentage), json!(duration_ms)],
        )
    }

    pub fn ping() -> Self {
        Command::new(Method::Ping, Vec::new())
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl DeviceError {
    /// True for the device's "method not supported" answer.
    pub fn is_method_not_supported(&self) -> bool {
        self.code == METHOD_NOT_SUPPORTED_CODE
            && self.message.to_lowercase().contains("not supported")
    }
}

/// A decoded response frame correlated to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeviceError>,
}

/// What a completed command produced, delivered to the caller and to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub action: Method,
    pub command: Command,
    pub result: CommandResult,
    pub success: bool,
}

impl CommandOutcome {
    pub fn error_message(&self) -> String {
        match &self.result.error {
            Some(error) => format!("{} (code {})", error.message, error.code),
            None => "no error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led::flow::FlowMode;

    #[test]
    fn method_names_round_trip_through_from_str() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
            assert_eq!(
                serde_json::to_value(method).unwrap(),
                json!(method.as_str())
            );
        }
        assert!("props".parse::<Method>().is_err());
    }

    #[test]
    fn command_without_id_omits_it() {
        let command = Command::toggle();
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({"method": "toggle", "params": []})
        );
    }

    #[test]
    fn builders_produce_wire_params() {
        assert_eq!(
            Command::set_power(true, Effect::Smooth, 500).params,
            vec![json!("on"), json!("smooth"), json!(500)]
        );
        assert_eq!(
            Command::set_rgb(&Color::new(0, 0, 255), Effect::Smooth, DEFAULT_DURATION_MS).params,
            vec![json!(255), json!("smooth"), json!(500)]
        );
        assert_eq!(
            Command::set_hsv(240, 100, Effect::Smooth, 500).params,
            vec![json!(240), json!(100), json!("smooth"), json!(500)]
        );
        assert_eq!(
            Command::set_bright(1, Effect::Sudden, 500).params,
            vec![json!(1), json!("sudden"), json!(500)]
        );
        assert_eq!(
            Command::set_adjust(AdjustAction::Increase, AdjustProperty::Bright).params,
            vec![json!("increase"), json!("bright")]
        );
        assert_eq!(
            Command::get_property(&[DeviceProperty::Bright, DeviceProperty::Power]).params,
            vec![json!("bright"), json!("power")]
        );
        assert_eq!(Command::cron_add(0, 1).params, vec![json!(0), json!(1)]);
        assert_eq!(Command::cron_delete(0).method, Method::CronDelete);
    }

    #[test]
    fn adjust_picks_method_from_property() {
        let command = Command::adjust(AdjustProperty::Bright, 5, 500);
        assert_eq!(command.method, Method::AdjustBright);
        assert_eq!(command.params, vec![json!(5), json!(500)]);
        assert_eq!(
            Command::adjust(AdjustProperty::Color, -20, 500).method,
            Method::AdjustColor
        );
    }

    #[test]
    fn color_flow_joins_states() {
        let states = [
            FlowState::new(500, FlowMode::Color, Color::new(1, 254, 1).value(), 1),
            FlowState::new(500, FlowMode::Color, Color::new(255, 0, 0).value(), 1),
            FlowState::new(500, FlowMode::Color, Color::new(0, 0, 255).value(), 1),
        ];
        let command = Command::start_color_flow(&states, StartFlowAction::Stay, 0);
        assert_eq!(
            command.params,
            vec![
                json!(0),
                json!(1),
                json!("500,1,130561,1,500,1,16711680,1,500,1,255,1")
            ]
        );
    }

    #[test]
    fn music_mode_params() {
        assert_eq!(
            Command::set_music(true, "10.0.1.20", 80).params,
            vec![json!(1), json!("10.0.1.20"), json!(80)]
        );
        assert_eq!(Command::set_music(false, "", 0).params, vec![json!(0)]);
    }

    #[test]
    fn not_supported_detection() {
        let error = DeviceError {
            code: -1,
            message: "method not supported".to_string(),
        };
        assert!(error.is_method_not_supported());
        let general = DeviceError {
            code: -1,
            message: "General error".to_string(),
        };
        assert!(!general.is_method_not_supported());
    }

    #[test]
    fn outcome_serializes_with_record_keys() {
        let mut command = Command::set_name("bulb1");
        command.id = Some(1);
        let outcome = CommandOutcome {
            action: Method::SetName,
            command,
            result: CommandResult {
                id: 1,
                result: Some(vec![json!("ok")]),
                error: None,
            },
            success: true,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "action": "set_name",
                "command": {"id": 1, "method": "set_name", "params": ["bulb1"]},
                "result": {"id": 1, "result": ["ok"]},
                "success": true,
            })
        );
    }
}
