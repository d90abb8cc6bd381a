//! LAN peer discovery over UDP.
//!
//! Two best-effort datagram channels, both answering with nothing more than
//! an IP string:
//!
//! * **Broadcast**: a fresh node sends `DISCOVER_REQUEST` to the directed
//!   broadcast address and takes the first unicast reply that is not its
//!   own IP. No reply within the timeout means the node founds a new ring.
//! * **Multicast**: clients locate a server by sending `DISCOVER` to the
//!   multicast group; every node answers with its own IP.
//!
//! The responders hold no ring state and run for the process lifetime,
//! rebuilding their socket after I/O errors.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::RingConfig;

/// Payload of a node-to-node bootstrap probe.
pub const DISCOVER_REQUEST: &[u8] = b"DISCOVER_REQUEST";

/// Payload of a client-to-node probe.
pub const DISCOVER: &[u8] = b"DISCOVER";

/// Pause before rebuilding a responder socket after an error.
const REBUILD_BACKOFF: Duration = Duration::from_secs(1);

/// LAN discovery component: one probe, two responders.
pub struct Discovery {
    own_ip: String,
    broadcast_addr: Ipv4Addr,
    broadcast_port: u16,
    multicast_group: Ipv4Addr,
    multicast_port: u16,
    probe_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl Discovery {
    /// Create a discovery component for a node at `own_ip`.
    #[must_use]
    pub fn new(own_ip: impl Into<String>, config: &RingConfig) -> Self {
        Self {
            own_ip: own_ip.into(),
            broadcast_addr: config.broadcast_addr,
            broadcast_port: config.broadcast_port,
            multicast_group: config.multicast_group,
            multicast_port: config.multicast_port,
            probe_timeout: config.discovery_timeout,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Broadcast a bootstrap probe and wait for an existing member.
    ///
    /// Returns the first replying IP that differs from our own, or `None`
    /// after the timeout; the caller then founds a new ring.
    pub async fn discover(&self) -> Option<String> {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Discovery probe socket failed to bind");
                return None;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(error = %e, "SO_BROADCAST failed on probe socket");
            return None;
        }

        let target = SocketAddrV4::new(self.broadcast_addr, self.broadcast_port);
        if let Err(e) = socket.send_to(DISCOVER_REQUEST, target).await {
            warn!(target = %target, error = %e, "Discovery probe send failed");
            return None;
        }

        let deadline = Instant::now() + self.probe_timeout;
        let mut buf = [0u8; 256];

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                info!("No existing members answered the discovery probe");
                return None;
            };

            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => {
                    info!("No existing members answered the discovery probe");
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Discovery probe receive failed");
                    return None;
                }
                Ok(Ok((len, from))) => {
                    let ip = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                    if ip.is_empty() || ip == self.own_ip {
                        continue;
                    }
                    info!(peer = %ip, from = %from, "Existing member discovered");
                    return Some(ip);
                }
            }
        }
    }

    /// Spawn both probe responders. They run until [`Discovery::stop`].
    #[must_use]
    pub fn spawn_responders(&self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_broadcast_responder(), self.spawn_multicast_responder()]
    }

    /// Stop the responders at their next iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_broadcast_responder(&self) -> JoinHandle<()> {
        let own_ip = self.own_ip.clone();
        let port = self.broadcast_port;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let socket = match bind_reusable(port) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(port, error = %e, "Broadcast responder bind failed, retrying");
                        tokio::time::sleep(REBUILD_BACKOFF).await;
                        continue;
                    }
                };
                debug!(port, "Broadcast responder listening");
                respond_loop(&socket, DISCOVER_REQUEST, &own_ip, &running).await;
                tokio::time::sleep(REBUILD_BACKOFF).await;
            }
        })
    }

    fn spawn_multicast_responder(&self) -> JoinHandle<()> {
        let own_ip = self.own_ip.clone();
        let group = self.multicast_group;
        let port = self.multicast_port;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let socket = match bind_reusable(port) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(port, error = %e, "Multicast responder bind failed, retrying");
                        tokio::time::sleep(REBUILD_BACKOFF).await;
                        continue;
                    }
                };
                if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    warn!(group = %group, error = %e, "Joining multicast group failed, retrying");
                    tokio::time::sleep(REBUILD_BACKOFF).await;
                    continue;
                }
                debug!(group = %group, port, "Multicast responder listening");
                respond_loop(&socket, DISCOVER, &own_ip, &running).await;
                tokio::time::sleep(REBUILD_BACKOFF).await;
            }
        })
    }
}

/// Answer matching probes with our own IP until an I/O error or shutdown.
async fn respond_loop(socket: &UdpSocket, probe: &[u8], own_ip: &str, running: &AtomicBool) {
    let mut buf = [0u8; 256];
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if &buf[..len] == probe {
                    debug!(from = %from, "Answering discovery probe");
                    if let Err(e) = socket.send_to(own_ip.as_bytes(), from).await {
                        warn!(from = %from, error = %e, "Probe reply failed");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Probe responder socket error, rebuilding");
                return;
            }
        }
    }
}

/// UDP socket bound with address reuse, so a responder can share the probe
/// port with other processes on the host, handed to tokio non-blocking.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
