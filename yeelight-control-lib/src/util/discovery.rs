use std::cmp::max;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derivative::Derivative;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::util::codec::{parse_advertisement, probe_message};
use crate::util::device::{Device, DEFAULT_COMMAND_PORT};
use crate::util::ip_scan::{local_ipv4, probe_host, scan_subnet};
use crate::util::registry::{DeviceRegistry, Upsert};

/// Port devices listen on for search probes.
pub const DISCOVERY_PORT: u16 = 1982;

/// Multicast group devices join for search probes.
pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

const EVENT_CAPACITY: usize = 64;

/// Predicate deciding which discovered devices are kept.
pub type DeviceFilter = Arc<dyn Fn(&Device) -> bool + Send + Sync>;

#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct DiscoveryConfig {
    /// Destination port of the search probe.
    #[derivative(Default(value = "DISCOVERY_PORT"))]
    pub port: u16,
    #[derivative(Default(value = "MULTICAST_ADDRESS"))]
    pub multicast_address: Ipv4Addr,
    /// Local UDP port to bind, 0 for an ephemeral one.
    pub bind_port: u16,
    /// Local address used to pick the subnet for the fallback scan.
    /// Detected from the routing table when unset.
    pub local_address: Option<Ipv4Addr>,
    #[derivative(Default(value = "Duration::from_secs(10)"))]
    pub search_timeout: Duration,
    /// How often the probe is resent while searching.
    #[derivative(Default(value = "Duration::from_millis(200)"))]
    pub poll_interval: Duration,
    /// Stop as soon as this many devices are found, 0 searches until the timeout.
    #[derivative(Default(value = "1"))]
    pub limit: usize,
    /// Fall back to a TCP scan of the local subnet when nothing answers.
    #[derivative(Default(value = "true"))]
    pub fallback: bool,
    #[derivative(Default(value = "1"))]
    pub scan_start: u8,
    #[derivative(Default(value = "254"))]
    pub scan_end: u8,
    #[derivative(Default(value = "DEFAULT_COMMAND_PORT"))]
    pub scan_port: u16,
    #[derivative(Default(value = "Duration::from_secs(1)"))]
    pub probe_timeout: Duration,
    #[derivative(Default(value = "32"))]
    pub scan_concurrency: usize,
    #[derivative(Debug = "ignore")]
    pub filter: Option<DeviceFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Probing,
    Found,
    TimedOut,
    FallbackScanning,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    DeviceFound(Device),
    /// A device already seen in this session advertised again.
    DeviceUpdated(Device),
}

/**
One discovery session.

`start` sends search probes to the multicast group and collects the devices
that answer. If none do before `search_timeout`, it optionally falls back to
probing the command port of every host on the local /24 network.
*/
pub struct Discovery {
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
    events: Mutex<Option<broadcast::Sender<DiscoveryEvent>>>,
    cancel: CancellationToken,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Discovery {
            config,
            state: Mutex::new(DiscoveryState::Idle),
            events: Mutex::new(Some(events)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receiver of found/updated devices. Closed once the session is destroyed.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Runs the search and returns the devices found, in the order first seen.
    ///
    /// Returns early once `limit` devices are known. At the timeout any devices
    /// found so far are returned.
    pub async fn start(&self) -> Result<Vec<Device>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.set_state(DiscoveryState::Probing);

        let mut registry = DeviceRegistry::new();
        let limit_reached = self.search(&mut registry).await?;
        if limit_reached {
            self.set_state(DiscoveryState::Found);
        } else {
            self.set_state(DiscoveryState::TimedOut);
        }

        if !registry.is_empty() {
            info!("Discovery found {} device(s)", registry.len());
            self.set_state(DiscoveryState::Done);
            return Ok(registry.into_devices());
        }

        if !self.config.fallback {
            self.set_state(DiscoveryState::Done);
            return Err(Error::NoDeviceFound {
                waited: self.config.search_timeout,
            });
        }

        info!(
            "No answer to search probes after {:?}, scanning the local network",
            self.config.search_timeout
        );
        self.set_state(DiscoveryState::FallbackScanning);
        let result = self
            .scan_by_ip(self.config.scan_start, self.config.scan_end)
            .await;
        self.set_state(DiscoveryState::Done);
        match result {
            Ok(devices) if devices.is_empty() => Err(Error::NoDeviceFoundAfterScan),
            other => other,
        }
    }

    /// Probes the search group until the timeout, the limit, or cancellation.
    /// Returns whether the limit was reached.
    async fn search(&self, registry: &mut DeviceRegistry) -> Result<bool> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.bind_port)).await?;
        socket.set_broadcast(true)?;
        let target = SocketAddrV4::new(self.config.multicast_address, self.config.port);
        let probe = probe_message(target);

        let deadline = sleep_until(Instant::now() + self.config.search_timeout);
        tokio::pin!(deadline);
        let mut poll = interval(max(self.config.poll_interval, Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => return Ok(false),
                _ = poll.tick() => {
                    if let Err(e) = socket.send_to(probe.as_bytes(), target).await {
                        warn!("Failed to send search probe to {}: {}", target, e);
                    }
                }
                received = socket.recv_from(&mut buffer) => {
                    let (number_of_bytes, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Failed to receive search response: {}", e);
                            continue;
                        }
                    };
                    let message = String::from_utf8_lossy(&buffer[..number_of_bytes]);
                    debug!("Advertisement from {}: {:?}", source, message);
                    let Some(device) = parse_advertisement(&message) else {
                        continue;
                    };
                    self.record(registry, device);
                    if self.config.limit > 0 && registry.len() >= self.config.limit {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Probes the command port of the hosts `start..=end` on the local subnet.
    ///
    /// Reachable hosts are returned nearest-first as devices with only their
    /// endpoint known.
    pub async fn scan_by_ip(&self, start: u8, end: u8) -> Result<Vec<Device>> {
        if start == 0 || start > end {
            return Err(Error::InvalidValue(format!(
                "bad scan range {}..={}",
                start, end
            )));
        }
        let local = match self.config.local_address {
            Some(address) => address,
            None => {
                local_ipv4(SocketAddrV4::new(
                    self.config.multicast_address,
                    self.config.port,
                ))
                .await?
            }
        };

        let scan = scan_subnet(
            local,
            start,
            end,
            self.config.scan_port,
            self.config.probe_timeout,
            self.config.scan_concurrency,
        );
        let hosts = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            hosts = scan => hosts,
        };

        let mut registry = DeviceRegistry::new();
        for host in hosts {
            self.record(
                &mut registry,
                Device::from_endpoint(host.to_string(), self.config.scan_port),
            );
        }
        info!("IP scan found {} device(s)", registry.len());
        Ok(registry.into_devices())
    }

    /// Whether `ip` accepts connections on the command port.
    pub async fn detect_light(&self, ip: Ipv4Addr) -> bool {
        probe_host((ip, self.config.scan_port).into(), self.config.probe_timeout).await
    }

    /// Stops a running search and closes the event channel. Idempotent.
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Searches for `given_timeout`, collecting every device that answers.
    pub async fn find_devices(given_timeout: Duration) -> Result<Vec<Device>> {
        let discovery = Discovery::new(DiscoveryConfig {
            search_timeout: given_timeout,
            limit: 0,
            ..Default::default()
        });
        discovery.start().await
    }

    fn record(&self, registry: &mut DeviceRegistry, device: Device) {
        if let Some(filter) = &self.config.filter {
            if !filter(&device) {
                debug!("Filtered out {}", device);
                return;
            }
        }
        let event = match registry.upsert(device.clone()) {
            Upsert::Inserted => {
                info!("Found device: {}", device);
                DiscoveryEvent::DeviceFound(device)
            }
            Upsert::Replaced => DiscoveryEvent::DeviceUpdated(device),
        };
        self.emit(event);
    }

    fn emit(&self, event: DiscoveryEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = events.as_ref() {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn pretty_print_devices(devices: &[Device]) {
        fn column(devices: &[Device], header: &str, value: impl Fn(&Device) -> usize) -> usize {
            devices.iter().map(value).max().unwrap_or(0).max(header.len())
        }
        let host_width = column(devices, "Address", |d| d.host.len() + 1 + d.port.to_string().len());
        let id_width = column(devices, "Device ID", |d| d.id.len());
        let model_width = column(devices, "Model", |d| d.model.len());
        let name_width = max(column(devices, "Name", |d| d.name.len()), 12);
        let power_width = "Power".len();

        println!(
            "{:<host_width$}  {:<id_width$}  {:<model_width$}  {:<name_width$}  {:<power_width$}  Bright",
            "Address", "Device ID", "Model", "Name", "Power",
        );
        println!(
            "{}  {}  {}  {}  {}  {}",
            "-".repeat(host_width),
            "-".repeat(id_width),
            "-".repeat(model_width),
            "-".repeat(name_width),
            "-".repeat(power_width),
            "-".repeat("Bright".len()),
        );
        for device in devices {
            println!(
                "{:<host_width$}  {:<id_width$}  {:<model_width$}  {:<name_width$}  {:<power_width$}  {}",
                format!("{}:{}", device.host, device.port),
                device.id,
                device.model,
                device.name,
                device.power.to_string(),
                device.bright,
            );
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::device::PowerStatus;
    use tokio::net::TcpListener;

    fn advertisement(id: &str, port: u16) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
Cache-Control: max-age=3600\r\n\
Location: yeelight://127.0.0.1:{}\r\n\
id: {}\r\n\
model: color\r\n\
fw_ver: 18\r\n\
support: get_prop set_power toggle set_name\r\n\
power: off\r\n\
bright: 100\r\n\
color_mode: 2\r\n\
ct: 4000\r\n\
rgb: 16711680\r\n\
hue: 0\r\n\
sat: 0\r\n\
name: desk\r\n",
            port, id
        )
    }

    /// Answers every search probe with one advertisement per id.
    async fn spawn_responder(ids: Vec<&'static str>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            while let Ok((n, source)) = socket.recv_from(&mut buffer).await {
                let request = String::from_utf8_lossy(&buffer[..n]);
                if !request.starts_with("M-SEARCH") {
                    continue;
                }
                for id in &ids {
                    let reply = advertisement(id, 55443);
                    let _ = socket.send_to(reply.as_bytes(), source).await;
                }
            }
        });
        port
    }

    fn local_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            port,
            multicast_address: Ipv4Addr::LOCALHOST,
            search_timeout: Duration::from_secs(2),
            fallback: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.port, 1982);
        assert_eq!(config.multicast_address, Ipv4Addr::new(239, 255, 255, 250));
        assert_eq!(config.bind_port, 0);
        assert_eq!(config.search_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.limit, 1);
        assert!(config.fallback);
        assert_eq!((config.scan_start, config.scan_end), (1, 254));
        assert_eq!(config.scan_port, 55443);
        assert_eq!(config.scan_concurrency, 32);
        assert!(config.filter.is_none());
    }

    #[tokio::test]
    async fn test_discovers_local_responder() {
        let port = spawn_responder(vec!["0x000000000af2608f"]).await;
        let discovery = Discovery::new(local_config(port));
        let mut events = discovery.subscribe();

        let devices = discovery.start().await.unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.id, "0x000000000af2608f");
        assert_eq!(device.host, "127.0.0.1");
        assert_eq!(device.port, 55443);
        assert_eq!(device.name, "desk");
        assert_eq!(device.power, PowerStatus::Off);
        assert_eq!(discovery.state(), DiscoveryState::Done);

        match events.recv().await.unwrap() {
            DiscoveryEvent::DeviceFound(found) => assert_eq!(&found, device),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collects_until_timeout_without_limit() {
        let port = spawn_responder(vec!["0x1", "0x2"]).await;
        let discovery = Discovery::new(DiscoveryConfig {
            limit: 0,
            search_timeout: Duration::from_millis(700),
            ..local_config(port)
        });
        let mut events = discovery.subscribe();

        let devices = discovery.start().await.unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["0x1", "0x2"]);

        let mut updated = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DiscoveryEvent::DeviceUpdated(_)) {
                updated += 1;
            }
        }
        // The probe is resent every poll interval, so each device answers more than once.
        assert!(updated > 0);
    }

    #[tokio::test]
    async fn test_filter_skips_devices() {
        let port = spawn_responder(vec!["0x1", "0x2"]).await;
        let discovery = Discovery::new(DiscoveryConfig {
            filter: Some(Arc::new(|device: &Device| device.id == "0x2")),
            ..local_config(port)
        });
        let devices = discovery.start().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "0x2");
    }

    #[tokio::test]
    async fn test_no_device_without_fallback() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let discovery = Discovery::new(DiscoveryConfig {
            search_timeout: Duration::from_millis(300),
            ..local_config(port)
        });
        match discovery.start().await {
            Err(Error::NoDeviceFound { waited }) => {
                assert_eq!(waited, Duration::from_millis(300))
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fallback_scan_finds_listener() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let discovery = Discovery::new(DiscoveryConfig {
            port: silent.local_addr().unwrap().port(),
            multicast_address: Ipv4Addr::LOCALHOST,
            search_timeout: Duration::from_millis(300),
            local_address: Some(Ipv4Addr::new(127, 0, 0, 2)),
            scan_start: 1,
            scan_end: 3,
            scan_port: listener.local_addr().unwrap().port(),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        });

        let devices = discovery.start().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].host, "127.0.0.1");
        assert!(devices[0].id.is_empty());
        assert_eq!(discovery.state(), DiscoveryState::Done);
    }

    #[tokio::test]
    async fn test_scan_by_ip_rejects_bad_range() {
        let discovery = Discovery::new(DiscoveryConfig::default());
        assert!(matches!(
            discovery.scan_by_ip(10, 5).await,
            Err(Error::InvalidValue(_))
        ));
        assert!(matches!(
            discovery.scan_by_ip(0, 5).await,
            Err(Error::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_detect_light() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let discovery = Discovery::new(DiscoveryConfig {
            scan_port: listener.local_addr().unwrap().port(),
            ..Default::default()
        });
        assert!(discovery.detect_light(Ipv4Addr::LOCALHOST).await);
    }

    #[tokio::test]
    async fn test_destroy_cancels_running_search() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery = Arc::new(Discovery::new(DiscoveryConfig {
            search_timeout: Duration::from_secs(30),
            ..local_config(silent.local_addr().unwrap().port())
        }));
        let mut events = discovery.subscribe();

        let running = tokio::spawn({
            let discovery = discovery.clone();
            async move { discovery.start().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        discovery.destroy();
        discovery.destroy();

        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(discovery.start().await, Err(Error::Cancelled)));
    }
}
