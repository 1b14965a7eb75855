use crate::config::KuromeConfig;
use crate::device::{Candidate, PeerIdentity, SavedDevice};
use crate::discovery::{Discovery, DiscoveryConfig, get_local_ip};
use crate::dispatcher::CommandDispatcher;
use crate::error::{KuromeError, Result};
use crate::events::{EVENT_CHANNEL_CAPACITY, KuromeEvent};
use crate::filesystem::FilesystemProvider;
use crate::link::{DEFAULT_RECEIVE_CAPACITY, Link, LinkError, LinkEvent};
use crate::local_fs::LocalFilesystem;
use crate::message::{Component, DeviceIdentityResponse, Message};
use crate::registry::SessionRegistry;
use crate::security::{IdentityProvider, KeyStore, SecurityProvider};
use crate::session::{DeviceSession, SessionContext, SessionHandle};
use crate::store::{JsonDeviceStore, SavedDeviceStore};
use crate::tls::{HandshakeRole, SecureChannelFactory};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CANDIDATE_CHANNEL_CAPACITY: usize = 16;

/// Root scope of a running peer: owns the listener, discovery, connection
/// attempts and every session. [`shutdown`](Self::shutdown) stops all of it.
pub struct KuromeService {
    config: KuromeConfig,
    identity: Arc<dyn IdentityProvider>,
    factory: SecureChannelFactory,
    ctx: SessionContext,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    next_message_id: AtomicI64,
}

impl KuromeService {
    pub fn new(
        config: KuromeConfig,
        security: Arc<dyn SecurityProvider>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn SavedDeviceStore>,
        fs: Arc<dyn FilesystemProvider>,
    ) -> Arc<Self> {
        let factory =
            SecureChannelFactory::from_provider(security.as_ref(), config.handshake_timeout());
        let dispatcher = CommandDispatcher::new(fs, identity.clone())
            .with_max_read_length(config.max_read_length);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = SessionContext {
            dispatcher: Arc::new(dispatcher),
            store,
            registry: Arc::new(SessionRegistry::new()),
            events,
            pair_timeout: config.pair_timeout(),
        };

        Arc::new(Self {
            config,
            identity,
            factory,
            ctx,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(1),
        })
    }

    /// Wires up the default collaborators: identity and saved devices in
    /// `storage_dir`, the local disk under `shared_root`.
    pub fn from_config(config: KuromeConfig) -> Result<Arc<Self>> {
        let keys = Arc::new(KeyStore::open(
            &config.storage_dir,
            config.device_name.clone(),
            config.platform,
        )?);
        let store = Arc::new(JsonDeviceStore::open(&config.storage_dir)?);
        let fs = Arc::new(LocalFilesystem::new(&config.shared_root)?);
        info!(
            "Serving {} as {} ({})",
            config.shared_root.display(),
            config.device_name,
            keys.fingerprint()
        );
        Ok(Self::new(config, keys.clone(), keys, store, fs))
    }

    pub fn config(&self) -> &KuromeConfig {
        &self.config
    }

    pub fn local_id(&self) -> String {
        self.identity.local_id()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.ctx.registry.get(id)
    }

    /// Devices we trust, sorted by name.
    pub fn saved_devices(&self) -> Vec<SavedDevice> {
        let mut devices = self.ctx.store.all();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KuromeEvent> {
        self.ctx.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Starts the TLS listener and discovery.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let local = self.listen().await?;
        self.start_discovery().await?;
        Ok(local)
    }

    /// Binds the service port and accepts peers. Returns the bound address.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind = SocketAddr::new(self.bind_ip()?, self.config.service_port);
        let listener = TcpListener::bind(bind).await.map_err(KuromeError::Io)?;
        let local = listener.local_addr().map_err(KuromeError::Io)?;
        info!("Listening on {}", local);

        let service = self.clone();
        self.track_worker(tokio::spawn(service.accept_loop(listener)));
        Ok(local)
    }

    pub async fn start_discovery(self: &Arc<Self>) -> Result<()> {
        let local_address = get_local_ip().unwrap_or_else(|| {
            warn!("Could not determine local IP, announcing loopback");
            Ipv4Addr::LOCALHOST
        });
        let discovery = Arc::new(Discovery::new(
            DiscoveryConfig {
                role: self.config.role.clone(),
                local_id: self.identity.local_id(),
                local_name: self.identity.local_name(),
                local_address,
                bind_address: self.bind_ip()?,
                discovery_port: self.config.discovery_port,
                broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
                service_port: self.config.service_port,
                announce_interval: self.config.announce_interval(),
            },
            self.ctx.registry.clone(),
        ));

        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
        for handle in discovery
            .spawn(candidate_tx, self.shutdown_tx.subscribe())
            .await?
        {
            self.track_worker(handle);
        }

        let service = self.clone();
        self.track_worker(tokio::spawn(service.candidate_loop(candidate_rx)));
        Ok(())
    }

    fn bind_ip(&self) -> Result<IpAddr> {
        self.config
            .bind_address
            .parse()
            .map_err(|_| KuromeError::InvalidAddress(self.config.bind_address.clone()))
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    fn track_session(&self, handle: JoinHandle<()>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|h| !h.is_finished());
        sessions.push(handle);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, address)) => {
                    debug!("Inbound connection from {}", address);
                    let service = self.clone();
                    self.track_worker(tokio::spawn(async move {
                        if let Err(e) = service.accept_peer(stream, address).await {
                            warn!("Inbound connection from {} failed: {}", address, e);
                            service.emit(KuromeEvent::ConnectionFailed {
                                address,
                                error: e.to_string(),
                            });
                        }
                    }));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Accept loop stopped");
    }

    async fn candidate_loop(self: Arc<Self>, mut candidates: mpsc::Receiver<Candidate>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let local_id = self.identity.local_id();
        loop {
            let candidate = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                candidate = candidates.recv() => match candidate {
                    Some(c) => c,
                    None => break,
                },
            };

            // Both sides hear each other; only the smaller id dials.
            if !should_dial(&local_id, &candidate.id) {
                continue;
            }
            self.emit(KuromeEvent::CandidateFound(candidate.clone()));

            let service = self.clone();
            self.track_worker(tokio::spawn(async move {
                let address = candidate.address;
                if let Err(e) = service.connect(candidate).await {
                    debug!("Connection to {} failed: {}", address, e);
                    service.emit(KuromeEvent::ConnectionFailed {
                        address,
                        error: e.to_string(),
                    });
                }
            }));
        }
        debug!("Candidate loop stopped");
    }

    /// Dials a candidate as the TLS client. A saved certificate for the
    /// candidate's id is pinned.
    pub async fn connect(self: &Arc<Self>, candidate: Candidate) -> Result<SessionHandle> {
        if !self.ctx.registry.try_begin(&candidate.id) {
            return Err(KuromeError::AlreadyConnected(candidate.id));
        }

        let result = self.guarded(self.dial(&candidate)).await;
        if result.is_err() {
            self.ctx.registry.abandon(&candidate.id);
        }
        result
    }

    async fn dial(self: &Arc<Self>, candidate: &Candidate) -> Result<SessionHandle> {
        info!(
            "Connecting to {} ({}) at {}",
            candidate.name, candidate.id, candidate.address
        );
        let stream = tokio::time::timeout(
            self.config.handshake_timeout(),
            TcpStream::connect(candidate.address),
        )
        .await
        .map_err(|_| KuromeError::Timeout(format!("connect to {}", candidate.address)))?
        .map_err(KuromeError::Io)?;
        let _ = stream.set_nodelay(true);

        let pinned = self
            .ctx
            .store
            .get(&candidate.id)
            .map(|saved| saved.certificate());
        let channel = self
            .factory
            .upgrade(stream, HandshakeRole::Client, pinned)
            .await?;

        let link = Link::with_max_frame_len(
            channel.stream,
            candidate.address,
            self.config.max_frame_len(),
        );
        let (mut receiver, _) = link
            .start(DEFAULT_RECEIVE_CAPACITY)
            .ok_or(KuromeError::NotConnected)?;

        let peer = match self
            .exchange_identity(&link, &mut receiver, channel.peer_certificate)
            .await
        {
            Ok(peer) if peer.id == candidate.id => peer,
            Ok(peer) => {
                link.close().await;
                return Err(KuromeError::Protocol(format!(
                    "{} announced id {} but identified as {}",
                    candidate.address, candidate.id, peer.id
                )));
            }
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        self.start_session(peer, link, receiver).await
    }

    async fn accept_peer(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        // The peer's id is unknown until after the handshake, so inbound
        // connections are always trust-on-first-use; the session compares
        // the certificate with the saved record.
        let channel = self
            .guarded(self.factory.upgrade(stream, HandshakeRole::Server, None))
            .await?;

        let link =
            Link::with_max_frame_len(channel.stream, address, self.config.max_frame_len());
        let (mut receiver, _) = link
            .start(DEFAULT_RECEIVE_CAPACITY)
            .ok_or(KuromeError::NotConnected)?;

        let peer = match self
            .guarded(self.exchange_identity(&link, &mut receiver, channel.peer_certificate))
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        if !self.ctx.registry.try_begin(&peer.id) {
            info!("Already connected to {}, dropping duplicate", peer.id);
            link.close().await;
            return Err(KuromeError::AlreadyConnected(peer.id));
        }
        let id = peer.id.clone();
        if let Err(e) = self.start_session(peer, link, receiver).await {
            self.ctx.registry.abandon(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn start_session(
        self: &Arc<Self>,
        peer: PeerIdentity,
        link: Arc<Link>,
        receiver: mpsc::Receiver<LinkEvent>,
    ) -> Result<SessionHandle> {
        if self.is_shutting_down() {
            link.close().await;
            return Err(KuromeError::NotConnected);
        }

        let started = DeviceSession::start(peer, link.clone(), receiver, self.ctx.clone());
        let (session, run) = match started {
            Ok(started) => started,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };
        self.track_session(run);

        let snapshot = session.snapshot();
        self.emit(KuromeEvent::SessionStarted {
            device_id: snapshot.id,
            device_name: snapshot.name,
            platform: snapshot.platform,
            address: snapshot.address,
            fingerprint: snapshot.fingerprint,
            status: snapshot.status,
        });
        Ok(session)
    }

    /// Both sides query each other's identity right after the handshake.
    /// Returns once the answer to our query arrives, answering the peer's
    /// query meanwhile.
    async fn exchange_identity(
        &self,
        link: &Arc<Link>,
        receiver: &mut mpsc::Receiver<LinkEvent>,
        certificate: CertificateDer<'static>,
    ) -> Result<PeerIdentity> {
        let query_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        link.try_send(&Message::new(query_id, Component::DeviceIdentityQuery).encode()?)
            .await?;

        let identity = tokio::time::timeout(
            self.config.handshake_timeout(),
            self.await_identity(link, receiver, query_id),
        )
        .await
        .map_err(|_| KuromeError::Timeout("identity exchange".to_string()))??;

        if identity.id.is_empty() {
            return Err(KuromeError::Protocol("peer sent an empty id".to_string()));
        }
        if identity.id == self.identity.local_id() {
            return Err(KuromeError::Protocol("connected to ourselves".to_string()));
        }

        Ok(PeerIdentity {
            id: identity.id,
            name: identity.name,
            platform: identity.platform,
            certificate,
        })
    }

    async fn await_identity(
        &self,
        link: &Arc<Link>,
        receiver: &mut mpsc::Receiver<LinkEvent>,
        query_id: i64,
    ) -> Result<DeviceIdentityResponse> {
        loop {
            let message = match receiver.recv().await {
                Some(Ok(message)) => message,
                Some(Err(LinkError::Parse(e))) => {
                    debug!("Malformed message during identity exchange: {}", e);
                    continue;
                }
                Some(Err(LinkError::Connection(e))) => {
                    return Err(KuromeError::Protocol(format!(
                        "connection lost during identity exchange: {}",
                        e
                    )));
                }
                None => return Err(KuromeError::NotConnected),
            };

            match message.component {
                Component::DeviceIdentityQuery => {
                    let dispatcher = self.ctx.dispatcher.clone();
                    let id = message.id;
                    let reply = tokio::task::spawn_blocking(move || dispatcher.identity_response(id))
                        .await
                        .map_err(|e| KuromeError::Protocol(e.to_string()))?;
                    link.try_send(&reply.encode()?).await?;
                }
                Component::DeviceIdentityResponse(identity) if message.id == query_id => {
                    return Ok(identity);
                }
                other => debug!(
                    "Ignoring {:?} before identity exchange completed",
                    other.component_type()
                ),
            }
        }
    }

    /// Runs `attempt` unless shutdown starts first.
    async fn guarded<T>(&self, attempt: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(KuromeError::NotConnected),
            result = attempt => result,
        }
    }

    /// Stops discovery and the listener, closes every link and waits for all
    /// tasks to finish.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down");

        loop {
            let workers = std::mem::take(&mut *self.workers.lock());
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!("Task failed during shutdown: {}", e);
                }
            }
        }

        self.ctx.registry.close_all().await;
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            if let Err(e) = session.await {
                warn!("Session task failed during shutdown: {}", e);
            }
        }
        info!("Shutdown complete");
    }

    fn emit(&self, event: KuromeEvent) {
        let _ = self.ctx.events.send(event);
    }
}

impl std::fmt::Debug for KuromeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KuromeService")
            .field("id", &self.identity.local_id())
            .field("registry", &self.ctx.registry)
            .finish()
    }
}

/// Of two peers that discover each other, only the one with the smaller id
/// dials, so they do not race two connections into each other.
pub fn should_dial(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}
