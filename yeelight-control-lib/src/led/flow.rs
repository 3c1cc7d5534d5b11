use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What a single flow step changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlowMode {
    Color = 1,
    Temperature = 2,
    Sleep = 7,
}

/// What the bulb does once a color flow stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[repr(u8)]
pub enum StartFlowAction {
    /// Return to the state before the flow started.
    Recover = 0,
    /// Stay at the last flow state.
    #[default]
    Stay = 1,
    /// Turn the bulb off.
    Off = 2,
}

/// One `[duration, mode, value, brightness]` tuple of a flow expression.
///
/// `value` is the packed RGB value for [`FlowMode::Color`], kelvin for
/// [`FlowMode::Temperature`] and ignored for [`FlowMode::Sleep`].
/// A brightness of -1 leaves brightness unchanged for that step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Gradual change or sleep time in milliseconds, at least 50.
    pub duration_ms: u64,
    pub mode: FlowMode,
    pub value: u32,
    pub brightness: i8,
}

impl FlowState {
    pub fn new(duration_ms: u64, mode: FlowMode, value: u32, brightness: i8) -> Self {
        FlowState {
            duration_ms,
            mode,
            value,
            brightness,
        }
    }

    pub fn sleep(duration_ms: u64) -> Self {
        FlowState::new(duration_ms, FlowMode::Sleep, 0, 0)
    }

    pub fn state(&self) -> [i64; 4] {
        [
            self.duration_ms as i64,
            self.mode as i64,
            self.value as i64,
            self.brightness as i64,
        ]
    }
}

/// Flattens states into the comma separated flow expression.
pub fn flow_expression(states: &[FlowState]) -> String {
    states
        .iter()
        .flat_map(|state| state.state())
        .map(|part| part.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_expression() {
        let states = [
            FlowState::new(1000, FlowMode::Temperature, 2700, 100),
            FlowState::new(500, FlowMode::Color, 255, 10),
            FlowState::sleep(5000),
            FlowState::new(500, FlowMode::Temperature, 5000, -1),
        ];
        assert_eq!(
            flow_expression(&states),
            "1000,2,2700,100,500,1,255,10,5000,7,0,0,500,2,5000,-1"
        );
    }

    #[test]
    fn test_empty_flow_expression() {
        assert_eq!(flow_expression(&[]), "");
    }

    #[test]
    fn test_default_action_is_stay() {
        assert_eq!(StartFlowAction::default() as u8, 1);
    }
}
