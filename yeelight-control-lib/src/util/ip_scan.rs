//! TCP port probing of nearby LAN addresses, used when multicast discovery
//! finds nothing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, info};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Lowest and highest host octet worth probing.
const FIRST_HOST: u8 = 1;
const LAST_HOST: u8 = 254;

/// Host octets in `[from, to]`, nearest to `center` first.
///
/// Walks outwards one step at a time, taking the lower neighbour before the
/// upper one, so `candidate_hosts(5, 1, 10)` is `[4, 6, 3, 7, 2, 8, 1, 9, 10]`.
/// `center` itself is never included, neither are 0 and 255.
pub fn candidate_hosts(center: u8, from: u8, to: u8) -> Vec<u8> {
    let from = from.max(FIRST_HOST) as i16;
    let to = to.min(LAST_HOST) as i16;
    let center = center as i16;

    let mut hosts = Vec::new();
    let mut below = center;
    let mut above = center;
    while below > from || above < to {
        below -= 1;
        above += 1;
        if below >= from {
            hosts.push(below as u8);
        }
        if above <= to {
            hosts.push(above as u8);
        }
    }
    hosts
}

/// The address the OS would use to reach `target`.
///
/// Connecting a UDP socket sends nothing, it only selects a route.
pub async fn local_ipv4(target: SocketAddrV4) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(address) if !address.is_unspecified() => Ok(address),
        other => Err(Error::InvalidValue(format!(
            "no usable local IPv4 address (got {})",
            other
        ))),
    }
}

/// Whether something accepts TCP connections on `address` within `probe_timeout`.
pub async fn probe_host(address: SocketAddr, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", address, e);
            false
        }
        Err(_) => false,
    }
}

/// Probes `port` on every candidate host of `local`'s /24 network.
///
/// At most `concurrency` probes are in flight; reachable hosts are returned
/// in candidate order.
pub async fn scan_subnet(
    local: Ipv4Addr,
    from: u8,
    to: u8,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
) -> Vec<Ipv4Addr> {
    let [a, b, c, center] = local.octets();
    let candidates = candidate_hosts(center, from, to);
    info!(
        "Scanning {} hosts of {}.{}.{}.0/24 on port {}",
        candidates.len(),
        a,
        b,
        c,
        port
    );

    stream::iter(candidates)
        .map(|host| {
            let address = Ipv4Addr::new(a, b, c, host);
            async move {
                let reachable =
                    probe_host(SocketAddr::from((address, port)), probe_timeout).await;
                (address, reachable)
            }
        })
        .buffered(concurrency.max(1))
        .filter_map(|(address, reachable)| async move { reachable.then_some(address) })
        .collect()
        .await
}
