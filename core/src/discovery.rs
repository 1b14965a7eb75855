//! UDP broadcast discovery.
//!
//! Each peer periodically broadcasts `"<role>:<address>:<name>:<id>"` to the
//! discovery port and listens on the same port for everyone else's
//! announcements. Valid announcements from unknown peers become
//! [`Candidate`]s for the connection logic.

use crate::device::Candidate;
use crate::error::{KuromeError, Result};
use crate::registry::SessionRegistry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub const ANNOUNCE_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_DATAGRAM_SIZE: usize = 1024;

/// One parsed discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub role: String,
    pub address: Ipv4Addr,
    pub name: String,
    pub id: String,
}

impl Announcement {
    /// Returns `None` for anything that is not exactly four fields with a
    /// valid IPv4 address and a non-empty id.
    pub fn parse(text: &str) -> Option<Self> {
        let fields: Vec<&str> = text.trim_end_matches(['\0', '\n', '\r']).split(':').collect();
        let [role, address, name, id] = fields.as_slice() else {
            return None;
        };
        if role.is_empty() || id.is_empty() {
            return None;
        }
        let address = address.parse().ok()?;
        Some(Self {
            role: role.to_string(),
            address,
            name: name.to_string(),
            id: id.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            sanitize_field(&self.role),
            self.address,
            sanitize_field(&self.name),
            sanitize_field(&self.id)
        )
    }
}

fn sanitize_field(field: &str) -> String {
    field.replace(':', "_")
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub role: String,
    pub local_id: String,
    pub local_name: String,
    pub local_address: Ipv4Addr,
    pub bind_address: IpAddr,
    pub discovery_port: u16,
    /// Where announcements are sent; the limited broadcast address normally.
    pub broadcast_address: IpAddr,
    /// TCP port candidates are dialed on.
    pub service_port: u16,
    pub announce_interval: Duration,
}

impl DiscoveryConfig {
    fn announcement(&self) -> Announcement {
        Announcement {
            role: self.role.clone(),
            address: self.local_address,
            name: self.local_name.clone(),
            id: self.local_id.clone(),
        }
    }
}

pub struct Discovery {
    config: DiscoveryConfig,
    registry: Arc<SessionRegistry>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    pub async fn bind(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(SocketAddr::new(
            self.config.bind_address,
            self.config.discovery_port,
        ))
        .await
        .map_err(|e| {
            KuromeError::Discovery(format!(
                "Failed to bind discovery port {}: {}",
                self.config.discovery_port, e
            ))
        })?;
        socket
            .set_broadcast(true)
            .map_err(|e| KuromeError::Discovery(format!("Failed to enable broadcast: {}", e)))?;
        Ok(socket)
    }

    /// Binds the discovery socket and starts the announce and listen loops.
    /// Both stop when `shutdown` turns true.
    pub async fn spawn(
        self: Arc<Self>,
        candidates: mpsc::Sender<Candidate>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let socket = Arc::new(self.bind().await?);
        info!(
            "Discovery on port {} as {:?}",
            self.config.discovery_port, self.config.local_name
        );

        let announcer = tokio::spawn(
            self.clone()
                .announce_loop(socket.clone(), shutdown.clone()),
        );
        let listener = tokio::spawn(self.listen_loop(socket, candidates, shutdown));
        Ok(vec![announcer, listener])
    }

    pub async fn announce_loop(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
        let payload = self.config.announcement().encode();
        let target = SocketAddr::new(self.config.broadcast_address, self.config.discovery_port);
        let mut interval = tokio::time::interval(self.config.announce_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = send_with_retry(&socket, payload.as_bytes(), target).await {
                warn!("Announcement to {} failed: {}", target, e);
            }
        }
        debug!("Announce loop stopped");
    }

    pub async fn listen_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        candidates: mpsc::Sender<Candidate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep going.
                    debug!("Discovery receive error: {}", e);
                    continue;
                }
            };

            let Some(candidate) = self.candidate_from(&buf[..len], from) else {
                continue;
            };
            debug!("Candidate {} ({}) at {}", candidate.name, candidate.id, candidate.address);
            if candidates.send(candidate).await.is_err() {
                debug!("Candidate consumer went away");
                break;
            }
        }
        debug!("Listen loop stopped");
    }

    /// Filters one datagram: malformed, our own and already known peers are
    /// dropped.
    pub fn candidate_from(&self, datagram: &[u8], from: SocketAddr) -> Option<Candidate> {
        let Ok(text) = std::str::from_utf8(datagram) else {
            trace!("Non-UTF-8 announcement from {}", from);
            return None;
        };
        let Some(announcement) = Announcement::parse(text) else {
            trace!("Malformed announcement from {}: {:?}", from, text);
            return None;
        };
        if announcement.id == self.config.local_id {
            return None;
        }
        if self.registry.contains(&announcement.id) {
            trace!("Ignoring announcement from known peer {}", announcement.id);
            return None;
        }

        Some(Candidate {
            role: announcement.role,
            id: announcement.id,
            name: announcement.name,
            address: SocketAddr::new(IpAddr::V4(announcement.address), self.config.service_port),
        })
    }
}

async fn send_with_retry(socket: &UdpSocket, payload: &[u8], target: SocketAddr) -> std::io::Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match socket.send_to(payload, target).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < ANNOUNCE_ATTEMPTS => {
                trace!("Announcement attempt {} failed: {}", attempt, e);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Best guess at the address peers can reach us on.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(local_id: &str, port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            role: "desktop".into(),
            local_id: local_id.into(),
            local_name: "Desk".into(),
            local_address: Ipv4Addr::LOCALHOST,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: port,
            broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            service_port: 33587,
            announce_interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_announcement_parsing() {
        let a = Announcement::parse("phone:192.168.1.20:Pixel 8:abc-123").unwrap();
        assert_eq!(a.role, "phone");
        assert_eq!(a.address, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(a.name, "Pixel 8");
        assert_eq!(a.id, "abc-123");
        assert_eq!(Announcement::parse(&a.encode()), Some(a));

        assert!(Announcement::parse("phone:192.168.1.20:Pixel").is_none());
        assert!(Announcement::parse("phone:192.168.1.20:Pixel:id:extra").is_none());
        assert!(Announcement::parse("phone:not-an-ip:Pixel:id").is_none());
        assert!(Announcement::parse("phone:192.168.1.20:Pixel:").is_none());
        assert!(Announcement::parse("").is_none());
    }

    #[test]
    fn test_names_with_colons_are_sanitised() {
        let a = Announcement {
            role: "desktop".into(),
            address: Ipv4Addr::new(10, 0, 0, 1),
            name: "host:with:colons".into(),
            id: "id-1".into(),
        };
        let parsed = Announcement::parse(&a.encode()).unwrap();
        assert_eq!(parsed.name, "host_with_colons");
        assert_eq!(parsed.id, "id-1");
    }

    #[test]
    fn test_candidate_filtering() {
        let registry = Arc::new(SessionRegistry::new());
        let discovery = Discovery::new(config("me", 0), registry.clone());
        let from: SocketAddr = "192.168.1.20:33586".parse().unwrap();

        let candidate = discovery
            .candidate_from(b"phone:192.168.1.20:Pixel:peer-1", from)
            .unwrap();
        assert_eq!(candidate.address, "192.168.1.20:33587".parse().unwrap());

        assert!(discovery.candidate_from(b"desktop:127.0.0.1:Desk:me", from).is_none());
        assert!(discovery.candidate_from(b"garbage", from).is_none());
        assert!(discovery.candidate_from(&[0xff, 0xfe], from).is_none());

        assert!(registry.try_begin("peer-1"));
        assert!(discovery
            .candidate_from(b"phone:192.168.1.20:Pixel:peer-1", from)
            .is_none());
    }

    #[tokio::test]
    async fn test_listener_survives_malformed_packets() {
        let registry = Arc::new(SessionRegistry::new());
        let discovery = Arc::new(Discovery::new(config("me", 0), registry));
        let socket = Arc::new(discovery.bind().await.unwrap());
        let port = socket.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(discovery.listen_loop(socket, tx, shutdown_rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        sender.send_to(b"nonsense", target).await.unwrap();
        sender.send_to(b"a:b:c", target).await.unwrap();
        sender
            .send_to(b"phone:10.1.2.3:Pixel:peer-9", target)
            .await
            .unwrap();

        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.id, "peer-9");
        assert_eq!(candidate.role, "phone");

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_announcer_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let discovery = Arc::new(Discovery::new(
            config("announcer-1", port),
            Arc::new(SessionRegistry::new()),
        ));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let announcer = tokio::spawn(discovery.announce_loop(socket, shutdown_rx));

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        let announcement = Announcement::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert_eq!(announcement.id, "announcer-1");
        assert_eq!(announcement.address, Ipv4Addr::LOCALHOST);

        shutdown_tx.send(true).unwrap();
        announcer.await.unwrap();
    }
}
