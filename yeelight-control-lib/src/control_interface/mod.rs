use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::led::color::Color;
use crate::led::flow::{FlowState, StartFlowAction};
use crate::led::scene::Scene;
use crate::util::device::{Device, DEFAULT_COMMAND_PORT};

use self::command::{
    AdjustAction, AdjustProperty, Command, CommandOutcome, DeviceProperty, Effect,
};
use self::connection::Shared;
pub use self::connection::ConnectionState;

pub mod command;
pub mod connection;
pub mod pending;

#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug, Default)]
pub struct ClientConfig {
    pub host: String,
    #[derivative(Default(value = "DEFAULT_COMMAND_PORT"))]
    pub port: u16,
    #[derivative(Default(value = "Duration::from_secs(5)"))]
    pub connect_timeout: Duration,
    /// How long a command waits for its response.
    #[derivative(Default(value = "Duration::from_millis(5000)"))]
    pub command_timeout: Duration,
    /// Reconnect after an unexpected connection loss.
    #[derivative(Default(value = "true"))]
    pub auto_reconnect: bool,
    #[derivative(Default(value = "Duration::from_secs(5)"))]
    pub reconnect_delay: Duration,
    /// Interval between keepalive pings, `None` disables them.
    #[derivative(Default(value = "Some(Duration::from_secs(30))"))]
    pub keepalive_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            ..Default::default()
        }
    }
}

/// Notifications published by a [`Yeelight`] client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A reconnect attempt failed.
    Error(String),
    /// A command was handed to the writer, id already assigned.
    CommandSent(Command),
    /// Any response matched to a pending command.
    CommandCompleted(CommandOutcome),
    /// A response carrying a non-empty result list.
    CommandSuccess(CommandOutcome),
    /// A response carrying an error object.
    CommandError(CommandOutcome),
    CommandTimedOut(Command),
    /// Unsolicited `props` notification; carries the changed properties.
    PropsChanged(Value),
}

/**
Client for one bulb's LAN command interface.

Handles are cheap to clone and share one connection. Dropping the last
handle stops the background tasks.

```no_run
use yeelight_control_lib::control_interface::{ClientConfig, Yeelight};
use yeelight_control_lib::control_interface::command::Effect;

#[tokio::main]
async fn main() -> yeelight_control_lib::Result<()> {
    let light = Yeelight::new(ClientConfig::new("192.168.1.20"));
    light.connect().await?;
    light.set_bright(40, Effect::Smooth, 500).await?;
    light.disconnect().await;
    Ok(())
}
```
*/
#[derive(Clone)]
pub struct Yeelight {
    shared: Arc<Shared>,
}

impl fmt::Debug for Yeelight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.shared.config();
        f.debug_struct("Yeelight")
            .field("host", &config.host)
            .field("port", &config.port)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Yeelight {
    pub fn new(config: ClientConfig) -> Self {
        Yeelight {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// A client for a discovered device, with default settings otherwise.
    pub fn from_device(device: &Device) -> Self {
        Yeelight::new(ClientConfig {
            host: device.host.clone(),
            port: device.port,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.shared.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.subscribe()
    }

    /// Opens the connection. Fails with `AlreadyConnected` while connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        self.shared.open(false).await
    }

    /// Closes the connection and stops reconnecting. Pending commands fail
    /// with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        self.shared.close().await
    }

    /// Sends `command` and waits for the matching response.
    ///
    /// The id is assigned here; any id already set on `command` is replaced.
    pub async fn send_command(&self, command: Command) -> Result<CommandOutcome> {
        self.shared.send_command(command).await
    }

    pub async fn set_power(
        &self,
        turn_on: bool,
        effect: Effect,
        duration_ms: u64,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::set_power(turn_on, effect, duration_ms))
            .await
    }

    pub async fn toggle(&self) -> Result<CommandOutcome> {
        self.send_command(Command::toggle()).await
    }

    /// Saves the current state as the power-on default.
    pub async fn set_default(&self) -> Result<CommandOutcome> {
        self.send_command(Command::set_default()).await
    }

    pub async fn start_color_flow(
        &self,
        states: &[FlowState],
        action: StartFlowAction,
        repeat: u32,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::start_color_flow(states, action, repeat))
            .await
    }

    pub async fn stop_color_flow(&self) -> Result<CommandOutcome> {
        self.send_command(Command::stop_color_flow()).await
    }

    pub async fn set_scene(&self, scene: &Scene) -> Result<CommandOutcome> {
        self.send_command(Command::set_scene(scene)).await
    }

    /// The result list holds the values in the order requested.
    pub async fn get_property(&self, properties: &[DeviceProperty]) -> Result<CommandOutcome> {
        self.send_command(Command::get_property(properties)).await
    }

    pub async fn set_ct_abx(&self, ct: u32, effect: Effect, duration_ms: u64) -> Result<CommandOutcome> {
        self.send_command(Command::set_ct_abx(ct, effect, duration_ms))
            .await
    }

    pub async fn set_rgb(
        &self,
        color: &Color,
        effect: Effect,
        duration_ms: u64,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::set_rgb(color, effect, duration_ms))
            .await
    }

    pub async fn set_hsv(
        &self,
        hue: u16,
        sat: u8,
        effect: Effect,
        duration_ms: u64,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::set_hsv(hue, sat, effect, duration_ms))
            .await
    }

    pub async fn set_bright(
        &self,
        brightness: u8,
        effect: Effect,
        duration_ms: u64,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::set_bright(brightness, effect, duration_ms))
            .await
    }

    pub async fn cron_add(&self, cron_type: u32, minutes: u32) -> Result<CommandOutcome> {
        self.send_command(Command::cron_add(cron_type, minutes)).await
    }

    pub async fn cron_get(&self, cron_type: u32) -> Result<CommandOutcome> {
        self.send_command(Command::cron_get(cron_type)).await
    }

    pub async fn cron_delete(&self, cron_type: u32) -> Result<CommandOutcome> {
        self.send_command(Command::cron_delete(cron_type)).await
    }

    pub async fn set_adjust(
        &self,
        action: AdjustAction,
        property: AdjustProperty,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::set_adjust(action, property)).await
    }

    pub async fn set_music(&self, on: bool, host: &str, port: u16) -> Result<CommandOutcome> {
        self.send_command(Command::set_music(on, host, port)).await
    }

    pub async fn set_name(&self, name: &str) -> Result<CommandOutcome> {
        self.send_command(Command::set_name(name)).await
    }

    pub async fn adjust(
        &self,
        property: AdjustProperty,
        percentage: i8,
        duration_ms: u64,
    ) -> Result<CommandOutcome> {
        self.send_command(Command::adjust(property, percentage, duration_ms))
            .await
    }

    pub async fn ping(&self) -> Result<CommandOutcome> {
        self.send_command(Command::ping()).await
    }
}
