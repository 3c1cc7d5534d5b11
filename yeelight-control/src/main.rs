use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use yeelight_control_lib::control_interface::command::{
    AdjustProperty, CommandOutcome, DeviceProperty, Effect, DEFAULT_DURATION_MS,
};
use yeelight_control_lib::control_interface::{ClientConfig, ClientEvent, Yeelight};
use yeelight_control_lib::led::color::{CliColors, Color};
use yeelight_control_lib::led::flow::{FlowMode, FlowState, StartFlowAction};
use yeelight_control_lib::led::scene::Scene;
use yeelight_control_lib::util::device::{Device, DEFAULT_COMMAND_PORT};
use yeelight_control_lib::util::discovery::{Discovery, DiscoveryConfig};
use yeelight_control_lib::Error;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Controls Yeelight smart bulbs on the local network",
    version = "0.1.0"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` and `scan` commands.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum PowerState {
    On,
    Off,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the bulb
        #[clap(long)]
        ip: String,

        /// Command port of the bulb
        #[clap(long, default_value_t = DEFAULT_COMMAND_PORT)]
        port: u16,

        /// Command timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches for bulbs with the multicast search protocol
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        /// Stop after this many devices, 0 waits for the whole timeout
        #[clap(long, default_value_t = 0)]
        limit: usize,

        /// Do not scan the local network when nothing answers
        #[clap(long)]
        no_fallback: bool,
    },
    /// Probes the command port of every host on the local network
    #[clap(name = "scan")]
    Scan {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// First host number to probe
        #[clap(long, default_value_t = 1)]
        start: u8,

        /// Last host number to probe
        #[clap(long, default_value_t = 254)]
        end: u8,

        /// Local address whose /24 network is scanned
        #[clap(long)]
        local_address: Option<Ipv4Addr>,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Toggles the power.
    Toggle,
    /// Turns the bulb on or off.
    Power {
        #[clap(value_enum)]
        state: PowerState,

        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,

        /// Transition duration in milliseconds
        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Sets the brightness.
    Bright {
        /// Brightness in percent (1-100)
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        value: u8,

        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Sets an RGB color.
    Rgb {
        /// The color to display by name
        #[clap(value_enum)]
        color: Option<CliColors>,

        /// The color as six hex digits, e.g. 1AC3EF
        #[clap(long)]
        hex: Option<String>,

        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,

        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Sets the color temperature.
    Ct {
        /// Color temperature in kelvin (1700-6500)
        #[clap(value_parser = clap::value_parser!(u32).range(1700..=6500))]
        kelvin: u32,

        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Sets hue and saturation.
    Hsv {
        /// Hue (0-359)
        #[clap(value_parser = clap::value_parser!(u16).range(0..360))]
        hue: u16,

        /// Saturation (0-100)
        #[clap(value_parser = clap::value_parser!(u8).range(0..=100))]
        sat: u8,

        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Renames the bulb.
    Name { name: String },
    /// Reads device properties.
    #[clap(name = "get-prop")]
    GetProp {
        #[clap(value_enum, required = true)]
        properties: Vec<DeviceProperty>,
    },
    /// Saves the current state as the power-on default.
    #[clap(name = "set-default")]
    SetDefault,
    /// Stops a running color flow.
    #[clap(name = "stop-flow")]
    StopFlow,
    /// Cycles through red, green and blue.
    Flow {
        /// Number of state changes, 0 loops forever
        #[clap(long, default_value_t = 0)]
        repeat: u32,

        /// What to do when the flow stops
        #[clap(long, value_enum, default_value_t = StartFlowAction::Stay)]
        action: StartFlowAction,

        /// Milliseconds per step
        #[clap(long, default_value_t = 1000)]
        step: u64,
    },
    /// Switches on straight into a color at the given brightness.
    #[clap(name = "scene-color")]
    SceneColor {
        #[clap(value_enum)]
        color: CliColors,

        #[clap(long, default_value_t = 100)]
        bright: u8,
    },
    /// Checks that the bulb answers.
    Ping,
    /// Changes a property by a percentage.
    Adjust {
        #[clap(value_enum)]
        property: AdjustProperty,

        /// Percentage (-100 to 100)
        #[clap(allow_hyphen_values = true, value_parser = clap::value_parser!(i8).range(-100..=100))]
        percentage: i8,

        #[clap(long, default_value_t = DEFAULT_DURATION_MS)]
        duration: u64,
    },
    /// Prints property changes pushed by the bulb until interrupted.
    Watch,
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Discover {
            output,
            timeout,
            limit,
            no_fallback,
        } => {
            let discovery = Discovery::new(DiscoveryConfig {
                search_timeout: Duration::from_millis(timeout),
                limit,
                fallback: !no_fallback,
                ..Default::default()
            });
            let devices = discovery.start().await?;
            print_devices(&devices, output)?;
        }
        Commands::Scan {
            output,
            start,
            end,
            local_address,
        } => {
            let discovery = Discovery::new(DiscoveryConfig {
                local_address,
                ..Default::default()
            });
            let devices = discovery.scan_by_ip(start, end).await?;
            print_devices(&devices, output)?;
        }
        Commands::DeviceCall {
            ip,
            port,
            timeout,
            action,
        } => {
            let watching = matches!(action, DeviceAction::Watch);
            let light = Yeelight::new(ClientConfig {
                port,
                command_timeout: Duration::from_millis(timeout),
                auto_reconnect: watching,
                keepalive_interval: if watching {
                    ClientConfig::default().keepalive_interval
                } else {
                    None
                },
                ..ClientConfig::new(ip)
            });
            light.connect().await?;
            let result = run_action(&light, action).await;
            light.disconnect().await;
            result?;
        }
    }

    Ok(())
}

async fn run_action(light: &Yeelight, action: DeviceAction) -> Result<()> {
    match action {
        DeviceAction::Toggle => {
            light.toggle().await?;
            println!("Power toggled.");
        }
        DeviceAction::Power {
            state,
            effect,
            duration,
        } => {
            let turn_on = state == PowerState::On;
            light
                .set_power(turn_on, effect, duration)
                .await?;
            println!("Power set to {}.", if turn_on { "on" } else { "off" });
        }
        DeviceAction::Bright { value, duration } => {
            light
                .set_bright(value, Effect::Smooth, duration)
                .await?;
            println!("Brightness set to {}%.", value);
        }
        DeviceAction::Rgb {
            color,
            hex,
            red,
            green,
            blue,
            duration,
        } => {
            let color_to_show = match (color, hex, red, green, blue) {
                (Some(color_name), None, None, None, None) => color_name.into(),
                (None, Some(hex), None, None, None) => Color::from_hex(&hex)?,
                (None, None, Some(r), Some(g), Some(b)) => Color::new(r, g, b),
                _ => return Err(anyhow!("Invalid color specification")),
            };
            light
                .set_rgb(&color_to_show, Effect::Smooth, duration)
                .await?;
            println!("Color set to #{}.", color_to_show.to_hex());
        }
        DeviceAction::Ct { kelvin, duration } => {
            light
                .set_ct_abx(kelvin, Effect::Smooth, duration)
                .await?;
            println!("Color temperature set to {}K.", kelvin);
        }
        DeviceAction::Hsv { hue, sat, duration } => {
            light
                .set_hsv(hue, sat, Effect::Smooth, duration)
                .await?;
            println!("Hue set to {}, saturation to {}.", hue, sat);
        }
        DeviceAction::Name { name } => {
            light.set_name(&name).await?;
            println!("Name set to {:?}.", name);
        }
        DeviceAction::GetProp { properties } => {
            let outcome = light.get_property(&properties).await?;
            print_properties(&properties, &outcome);
        }
        DeviceAction::SetDefault => {
            light.set_default().await?;
            println!("Current state saved as default.");
        }
        DeviceAction::StopFlow => {
            light.stop_color_flow().await?;
            println!("Color flow stopped.");
        }
        DeviceAction::Flow {
            repeat,
            action,
            step,
        } => {
            let states: Vec<FlowState> = [CliColors::Red, CliColors::Green, CliColors::Blue]
                .into_iter()
                .map(|color| FlowState::new(step, FlowMode::Color, Color::from(color).value(), 100))
                .collect();
            light.start_color_flow(&states, action, repeat).await?;
            println!("Color flow started.");
        }
        DeviceAction::SceneColor { color, bright } => {
            light
                .set_scene(&Scene::Color {
                    color: color.into(),
                    brightness: bright,
                })
                .await?;
            println!("Scene set to {:?} at {}%.", color, bright);
        }
        DeviceAction::Ping => match light.ping().await {
            Ok(_) => println!("Device is alive."),
            Err(Error::Command(outcome))
                if outcome
                    .result
                    .error
                    .as_ref()
                    .is_some_and(|error| error.is_method_not_supported()) =>
            {
                println!("Device is alive (ping not supported).")
            }
            Err(e) => return Err(e.into()),
        },
        DeviceAction::Adjust {
            property,
            percentage,
            duration,
        } => {
            light
                .adjust(property, percentage, duration)
                .await?;
            println!("Adjusted {:?} by {}%.", property, percentage);
        }
        DeviceAction::Watch => watch(light).await?,
    }
    Ok(())
}

/// Prints pushed property changes until Ctrl-C.
async fn watch(light: &Yeelight) -> Result<()> {
    let mut events = light.subscribe();
    info!(
        "Watching {}:{}, press Ctrl-C to stop",
        light.config().host,
        light.config().port
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::PropsChanged(props)) => println!("{}", props),
                Ok(ClientEvent::Disconnected) => eprintln!("Connection lost, reconnecting..."),
                Ok(ClientEvent::Connected) => eprintln!("Connected."),
                Ok(ClientEvent::Error(message)) => eprintln!("Reconnect failed: {}", message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("Missed {} events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn print_properties(properties: &[DeviceProperty], outcome: &CommandOutcome) {
    let values = outcome.result.result.as_deref().unwrap_or_default();
    let width = properties
        .iter()
        .map(|p| p.as_str().len())
        .max()
        .unwrap_or(0);
    for (property, value) in properties.iter().zip(values) {
        let value = match value.as_str() {
            Some(text) => text.to_string(),
            None => value.to_string(),
        };
        println!("{:<width$}  {}", property.as_str(), value);
    }
}

fn print_devices(devices: &[Device], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => {
            Discovery::pretty_print_devices(devices);
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(devices)?;
            println!("{}", json);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(devices)?;
            println!("{}", yaml);
        }
    }
    Ok(())
}
