//! Per-peer session: the pairing state machine and the loop that consumes a
//! [`Link`]'s messages.

use crate::device::{PeerIdentity, SavedDevice};
use crate::dispatcher::CommandDispatcher;
use crate::error::{KuromeError, Result};
use crate::events::KuromeEvent;
use crate::link::{Link, LinkError, LinkEvent};
use crate::message::{Component, HandlerKind, Message};
use crate::registry::{SessionRegistry, SessionSnapshot};
use crate::store::SavedDeviceStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PairStatus {
    #[default]
    Unpaired,
    /// We sent `Pair(true)` and wait for the answer.
    PairRequested,
    /// The peer sent `Pair(true)` and waits for a local decision.
    PairRequestedByPeer,
    Paired,
}

/// Anything that can move the pairing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairInput {
    Received { accept: bool },
    Request,
    Accept,
    Reject,
    Unpair,
    TimerFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairEffect {
    Send { accept: bool },
    StartTimer,
    CancelTimer,
    /// Save the peer as trusted.
    Persist,
    /// Drop the saved trust record.
    Forget,
    NotifyPeerRequest,
    NotifyTimeout,
    Unexpected,
}

/// The pairing transition table, free of I/O.
///
/// A pair request that times out is withdrawn with `Pair(false)`. For one
/// more timeout period after that, the next `Pair` message from the peer is
/// taken to be an answer that crossed the withdrawal and is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairMachine {
    status: PairStatus,
    late_reply_pending: bool,
}

impl PairMachine {
    pub fn new(status: PairStatus) -> Self {
        Self {
            status,
            late_reply_pending: false,
        }
    }

    pub fn status(&self) -> PairStatus {
        self.status
    }

    pub fn apply(&mut self, input: PairInput) -> Vec<PairEffect> {
        use PairEffect as E;
        use PairStatus as S;

        let (next, effects) = match (self.status, input) {
            (S::Unpaired, PairInput::Received { .. }) if self.late_reply_pending => {
                self.late_reply_pending = false;
                (S::Unpaired, vec![E::CancelTimer])
            }
            (S::Unpaired, PairInput::TimerFired) if self.late_reply_pending => {
                self.late_reply_pending = false;
                (S::Unpaired, vec![])
            }
            (S::Unpaired, PairInput::Received { accept: true }) => {
                (S::PairRequestedByPeer, vec![E::NotifyPeerRequest])
            }
            (S::Unpaired, PairInput::Request) => {
                self.late_reply_pending = false;
                (
                    S::PairRequested,
                    vec![E::Send { accept: true }, E::StartTimer],
                )
            }

            (S::PairRequested, PairInput::Received { accept: true }) => {
                (S::Paired, vec![E::CancelTimer, E::Persist])
            }
            (S::PairRequested, PairInput::Received { accept: false }) => {
                (S::Unpaired, vec![E::CancelTimer])
            }
            (S::PairRequested, PairInput::TimerFired) => {
                self.late_reply_pending = true;
                (
                    S::Unpaired,
                    vec![E::Send { accept: false }, E::NotifyTimeout, E::StartTimer],
                )
            }
            (S::PairRequested, PairInput::Unpair) => (
                S::Unpaired,
                vec![E::CancelTimer, E::Send { accept: false }],
            ),

            (S::PairRequestedByPeer, PairInput::Accept | PairInput::Request) => {
                (S::Paired, vec![E::Send { accept: true }, E::Persist])
            }
            (S::PairRequestedByPeer, PairInput::Reject) => {
                (S::Unpaired, vec![E::Send { accept: false }])
            }
            (S::PairRequestedByPeer, PairInput::Received { accept: false }) => {
                (S::Unpaired, vec![])
            }

            (S::Paired, PairInput::Received { accept: true }) => (S::Paired, vec![E::Unexpected]),
            (S::Paired, PairInput::Received { accept: false }) => (S::Unpaired, vec![E::Forget]),
            (S::Paired, PairInput::Unpair) => {
                (S::Unpaired, vec![E::Send { accept: false }, E::Forget])
            }

            (status, _) => (status, vec![]),
        };

        self.status = next;
        effects
    }
}

/// Which handlers may consume messages in a given [`PairStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerTable {
    active: Vec<HandlerKind>,
}

impl HandlerTable {
    pub fn for_status(status: PairStatus) -> Self {
        let mut active = vec![HandlerKind::Identity, HandlerKind::Pair];
        if status == PairStatus::Paired {
            active.push(HandlerKind::Filesystem);
        }
        Self { active }
    }

    pub fn handles(&self, kind: HandlerKind) -> bool {
        self.active.contains(&kind)
    }
}

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub dispatcher: Arc<CommandDispatcher>,
    pub store: Arc<dyn SavedDeviceStore>,
    pub registry: Arc<SessionRegistry>,
    pub events: broadcast::Sender<KuromeEvent>,
    pub pair_timeout: Duration,
}

pub type SessionHandle = Arc<DeviceSession>;

struct SessionState {
    machine: PairMachine,
    handlers: HandlerTable,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct DeviceSession {
    peer: PeerIdentity,
    fingerprint: String,
    link: Arc<Link>,
    ctx: SessionContext,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<PairStatus>,
    timer_tx: mpsc::UnboundedSender<u64>,
    // Our outstanding queries, by message id.
    pending: parking_lot::Mutex<HashMap<i64, oneshot::Sender<Message>>>,
    next_id: AtomicI64,
}

impl DeviceSession {
    /// Creates the session for an identified peer, registers it and spawns
    /// its consumption loop. The peer starts out paired only if the saved
    /// record holds exactly the certificate it presented.
    pub fn start(
        peer: PeerIdentity,
        link: Arc<Link>,
        receiver: mpsc::Receiver<LinkEvent>,
        ctx: SessionContext,
    ) -> Result<(SessionHandle, JoinHandle<()>)> {
        let status = match ctx.store.get(&peer.id) {
            Some(saved) if saved.trusts(&peer.certificate) => PairStatus::Paired,
            Some(_) => {
                warn!(
                    "Saved certificate for {} does not match, treating as unpaired",
                    peer.id
                );
                PairStatus::Unpaired
            }
            None => PairStatus::Unpaired,
        };

        let (status_tx, _) = watch::channel(status);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            fingerprint: peer.fingerprint(),
            peer,
            link,
            ctx,
            state: Mutex::new(SessionState {
                machine: PairMachine::new(status),
                handlers: HandlerTable::for_status(status),
                timer: None,
                generation: 0,
            }),
            status_tx,
            timer_tx,
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        });

        session.ctx.registry.register(&session.peer.id, session.clone())?;
        info!(
            "Session started with {} ({}) at {} as {:?}",
            session.peer.name,
            session.peer.id,
            session.link.peer_address(),
            status
        );

        let handle = tokio::spawn(session.clone().run(receiver, timer_rx));
        Ok((session, handle))
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn status(&self) -> PairStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<PairStatus> {
        self.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.peer.id.clone(),
            name: self.peer.name.clone(),
            platform: self.peer.platform,
            address: self.link.peer_address(),
            fingerprint: self.fingerprint.clone(),
            status: self.status(),
        }
    }

    /// Asks the peer to pair. A no-op while a request is pending or once
    /// paired; accepts the peer's own pending request.
    pub async fn request_pairing(self: &Arc<Self>) {
        self.apply(PairInput::Request).await;
    }

    pub async fn accept_pairing(self: &Arc<Self>) {
        self.apply(PairInput::Accept).await;
    }

    pub async fn reject_pairing(self: &Arc<Self>) {
        self.apply(PairInput::Reject).await;
    }

    /// Revokes trust (or withdraws a pending request) and tells the peer.
    pub async fn unpair(self: &Arc<Self>) {
        self.apply(PairInput::Unpair).await;
    }

    /// Closes the link; the session loop then tears everything down.
    pub async fn disconnect(&self) {
        self.link.close().await;
    }

    /// Sends a query and waits for the message answering it, which may be a
    /// `FailResponse`. The peer ignores queries until it considers us paired,
    /// so an unpaired query ends in a timeout.
    pub async fn query(&self, component: Component, timeout: Duration) -> Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = match Message::new(id, component).encode() {
            Ok(payload) => self.link.try_send(&payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KuromeError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(KuromeError::Timeout(format!("query {} to {}", id, self.peer.id)))
            }
        }
    }

    /// Sends a command. Commands are never answered.
    pub async fn command(&self, component: Component) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = Message::new(id, component).encode()?;
        self.link.try_send(&payload).await
    }

    async fn apply(self: &Arc<Self>, input: PairInput) {
        let mut state = self.state.lock().await;
        self.apply_locked(&mut state, input).await;
    }

    async fn apply_locked(self: &Arc<Self>, state: &mut SessionState, input: PairInput) {
        let from = state.machine.status();
        let effects = state.machine.apply(input);
        let to = state.machine.status();

        for effect in effects {
            match effect {
                PairEffect::Send { accept } => {
                    self.link.send_message(&Message::pair(accept)).await;
                }
                PairEffect::StartTimer => self.start_timer(state),
                PairEffect::CancelTimer => Self::cancel_timer(state),
                PairEffect::Persist => {
                    if let Err(e) = self.ctx.store.save(SavedDevice::from_identity(&self.peer)) {
                        error!("Failed to save paired device {}: {}", self.peer.id, e);
                    }
                }
                PairEffect::Forget => {
                    if let Err(e) = self.ctx.store.remove(&self.peer.id) {
                        error!("Failed to forget device {}: {}", self.peer.id, e);
                    }
                }
                PairEffect::NotifyPeerRequest => {
                    self.emit(KuromeEvent::PairRequestedByPeer {
                        device_id: self.peer.id.clone(),
                        device_name: self.peer.name.clone(),
                        fingerprint: self.fingerprint.clone(),
                    });
                }
                PairEffect::NotifyTimeout => {
                    info!("Pair request to {} timed out", self.peer.id);
                    self.emit(KuromeEvent::PairTimedOut {
                        device_id: self.peer.id.clone(),
                    });
                }
                PairEffect::Unexpected => {
                    warn!("Unexpected {:?} from {} while {:?}", input, self.peer.id, from);
                }
            }
        }

        if from != to {
            info!("Pairing with {}: {:?} -> {:?}", self.peer.id, from, to);
            state.handlers = HandlerTable::for_status(to);
            self.status_tx.send_replace(to);
            self.ctx.registry.update_status(&self.peer.id, to);
            self.emit(KuromeEvent::PairStatusChanged {
                device_id: self.peer.id.clone(),
                status: to,
            });
        } else {
            debug!("{:?} ignored for {} while {:?}", input, self.peer.id, from);
        }
    }

    fn start_timer(&self, state: &mut SessionState) {
        Self::cancel_timer(state);
        state.generation += 1;
        let generation = state.generation;
        let timeout = self.ctx.pair_timeout;
        let timer_tx = self.timer_tx.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(generation);
        }));
    }

    fn cancel_timer(state: &mut SessionState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    async fn on_timer(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        // A timer that lost the race against a reply or a cancel is stale.
        if state.timer.is_none() || state.generation != generation {
            debug!("Stale pair timer for {}", self.peer.id);
            return;
        }
        state.timer = None;
        self.apply_locked(&mut state, PairInput::TimerFired).await;
    }

    async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<LinkEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(generation) = timer_rx.recv() => self.on_timer(generation).await,
                event = receiver.recv() => match event {
                    Some(Ok(message)) => self.handle(message).await,
                    Some(Err(LinkError::Parse(e))) => {
                        debug!("Ignoring malformed message from {}: {}", self.peer.id, e);
                    }
                    Some(Err(LinkError::Connection(e))) => {
                        debug!("Link to {} failed: {}", self.peer.id, e);
                    }
                    None => break,
                },
            }
        }

        self.teardown().await;
    }

    async fn handle(self: &Arc<Self>, message: Message) {
        let kind = message.component_type().handler();
        if kind == HandlerKind::Unhandled {
            self.complete_query(message);
            return;
        }
        {
            let state = self.state.lock().await;
            if !state.handlers.handles(kind) {
                debug!(
                    "Dropping {:?} (id={}) from {} while {:?}",
                    message.component_type(),
                    message.id,
                    self.peer.id,
                    state.machine.status()
                );
                return;
            }
        }

        match kind {
            HandlerKind::Pair => {
                if let Component::Pair { accept } = message.component {
                    self.apply(PairInput::Received { accept }).await;
                }
            }
            HandlerKind::Identity => {
                let dispatcher = self.ctx.dispatcher.clone();
                let id = message.id;
                match tokio::task::spawn_blocking(move || dispatcher.identity_response(id)).await
                {
                    Ok(reply) => self.link.send_message(&reply).await,
                    Err(e) => error!("Identity handler panicked: {}", e),
                }
            }
            HandlerKind::Filesystem => {
                let dispatcher = self.ctx.dispatcher.clone();
                match tokio::task::spawn_blocking(move || dispatcher.dispatch(&message)).await {
                    Ok(Some(reply)) => self.link.send_message(&reply).await,
                    Ok(None) => {}
                    Err(e) => error!("Filesystem handler panicked: {}", e),
                }
            }
            HandlerKind::Unhandled => self.complete_query(message),
        }
    }

    fn complete_query(&self, message: Message) {
        let waiter = self.pending.lock().remove(&message.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(
                "Unsolicited {:?} (id={}) from {}",
                message.component_type(),
                message.id,
                self.peer.id
            ),
        }
    }

    async fn teardown(&self) {
        {
            let mut state = self.state.lock().await;
            Self::cancel_timer(&mut state);
        }
        // Dropping the senders fails every outstanding query.
        self.pending.lock().clear();
        self.ctx.registry.unregister(&self.peer.id);
        self.link.close().await;
        info!("Session with {} ended", self.peer.id);
        self.emit(KuromeEvent::Disconnected {
            device_id: self.peer.id.clone(),
        });
    }

    fn emit(&self, event: KuromeEvent) {
        // No subscribers is fine.
        let _ = self.ctx.events.send(event);
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("peer", &self.peer.id)
            .field("address", &self.link.peer_address())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;
    use crate::frame;
    use crate::link::{DEFAULT_MAX_FRAME_LEN, DEFAULT_RECEIVE_CAPACITY};
    use crate::local_fs::LocalFilesystem;
    use crate::security::KeyStore;
    use crate::store::MemoryDeviceStore;
    use rustls::pki_types::CertificateDer;
    use tokio::io::DuplexStream;

    #[test]
    fn test_pair_machine_transitions() {
        use PairStatus as S;

        let mut m = PairMachine::new(S::Unpaired);
        assert_eq!(
            m.apply(PairInput::Request),
            vec![PairEffect::Send { accept: true }, PairEffect::StartTimer]
        );
        assert_eq!(m.status(), S::PairRequested);
        assert!(m.apply(PairInput::Request).is_empty());
        assert_eq!(
            m.apply(PairInput::Received { accept: true }),
            vec![PairEffect::CancelTimer, PairEffect::Persist]
        );
        assert_eq!(m.status(), S::Paired);
        assert!(m.apply(PairInput::Request).is_empty());
        assert_eq!(
            m.apply(PairInput::Received { accept: true }),
            vec![PairEffect::Unexpected]
        );
        assert_eq!(m.apply(PairInput::Received { accept: false }), vec![PairEffect::Forget]);
        assert_eq!(m.status(), S::Unpaired);

        let mut m = PairMachine::new(S::Unpaired);
        m.apply(PairInput::Request);
        m.apply(PairInput::Received { accept: false });
        assert_eq!(m.status(), S::Unpaired);

        let mut m = PairMachine::new(S::Unpaired);
        assert_eq!(
            m.apply(PairInput::Received { accept: true }),
            vec![PairEffect::NotifyPeerRequest]
        );
        assert_eq!(m.status(), S::PairRequestedByPeer);
        assert_eq!(
            m.apply(PairInput::Request),
            vec![PairEffect::Send { accept: true }, PairEffect::Persist]
        );
        assert_eq!(m.status(), S::Paired);
    }

    #[test]
    fn test_timeout_withdraws_request_and_ignores_late_reply() {
        let mut m = PairMachine::new(PairStatus::Unpaired);
        m.apply(PairInput::Request);
        assert_eq!(
            m.apply(PairInput::TimerFired),
            vec![
                PairEffect::Send { accept: false },
                PairEffect::NotifyTimeout,
                PairEffect::StartTimer
            ]
        );
        assert_eq!(m.status(), PairStatus::Unpaired);

        assert_eq!(
            m.apply(PairInput::Received { accept: true }),
            vec![PairEffect::CancelTimer]
        );
        assert_eq!(m.status(), PairStatus::Unpaired);

        // Only the first message after the timeout is treated as late.
        m.apply(PairInput::Received { accept: true });
        assert_eq!(m.status(), PairStatus::PairRequestedByPeer);
    }

    #[test]
    fn test_late_reply_window_expires() {
        let mut m = PairMachine::new(PairStatus::Unpaired);
        m.apply(PairInput::Request);
        m.apply(PairInput::TimerFired);

        // The second timer closes the window without touching the peer.
        assert!(m.apply(PairInput::TimerFired).is_empty());
        assert_eq!(m.status(), PairStatus::Unpaired);

        assert_eq!(
            m.apply(PairInput::Received { accept: true }),
            vec![PairEffect::NotifyPeerRequest]
        );
        assert_eq!(m.status(), PairStatus::PairRequestedByPeer);
    }

    #[test]
    fn test_new_request_closes_late_reply_window() {
        let mut m = PairMachine::new(PairStatus::Unpaired);
        m.apply(PairInput::Request);
        m.apply(PairInput::TimerFired);

        m.apply(PairInput::Request);
        assert_eq!(m.status(), PairStatus::PairRequested);
        m.apply(PairInput::Received { accept: true });
        assert_eq!(m.status(), PairStatus::Paired);
    }

    #[test]
    fn test_timer_outside_pending_request_is_ignored() {
        let mut m = PairMachine::new(PairStatus::Paired);
        assert!(m.apply(PairInput::TimerFired).is_empty());
        assert_eq!(m.status(), PairStatus::Paired);
    }

    #[test]
    fn test_handler_table_gates_filesystem() {
        for status in [
            PairStatus::Unpaired,
            PairStatus::PairRequested,
            PairStatus::PairRequestedByPeer,
        ] {
            let table = HandlerTable::for_status(status);
            assert!(table.handles(HandlerKind::Identity));
            assert!(table.handles(HandlerKind::Pair));
            assert!(!table.handles(HandlerKind::Filesystem));
        }
        assert!(HandlerTable::for_status(PairStatus::Paired).handles(HandlerKind::Filesystem));
    }

    struct Harness {
        session: SessionHandle,
        run: JoinHandle<()>,
        store: Arc<MemoryDeviceStore>,
        registry: Arc<SessionRegistry>,
        events: broadcast::Receiver<KuromeEvent>,
        dir: tempfile::TempDir,
        peer: DuplexStream,
    }

    fn remote_identity() -> PeerIdentity {
        PeerIdentity {
            id: "phone-1".into(),
            name: "Phone".into(),
            platform: Platform::Android,
            certificate: CertificateDer::from(vec![0xAB; 32]),
        }
    }

    fn harness(store: Arc<MemoryDeviceStore>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(LocalFilesystem::new(dir.path()).unwrap());
        let keys = Arc::new(KeyStore::ephemeral("Desk".into(), Platform::Linux).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let (events_tx, events) = broadcast::channel(32);

        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let link = Link::new(ours, "10.0.0.2:33587".parse().unwrap());
        let (receiver, _) = link.start(DEFAULT_RECEIVE_CAPACITY).unwrap();

        let ctx = SessionContext {
            dispatcher: Arc::new(CommandDispatcher::new(fs, keys)),
            store: store.clone(),
            registry: registry.clone(),
            events: events_tx,
            pair_timeout: DEFAULT_PAIR_TIMEOUT,
        };
        assert!(registry.try_begin("phone-1"));
        let (session, run) = DeviceSession::start(remote_identity(), link, receiver, ctx).unwrap();

        Harness {
            session,
            run,
            store,
            registry,
            events,
            dir,
            peer,
        }
    }

    async fn send(peer: &mut DuplexStream, message: Message) {
        frame::write_frame(peer, &message.encode().unwrap())
            .await
            .unwrap();
    }

    async fn recv(peer: &mut DuplexStream) -> Message {
        Message::decode(&frame::read_frame(peer, DEFAULT_MAX_FRAME_LEN).await.unwrap()).unwrap()
    }

    async fn wait_for(session: &SessionHandle, status: PairStatus) {
        session
            .watch_status()
            .wait_for(|s| *s == status)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_then_peer_accepts() {
        let mut h = harness(Arc::new(MemoryDeviceStore::new()));
        assert_eq!(h.session.status(), PairStatus::Unpaired);
        assert_eq!(
            h.registry.snapshot().get("phone-1").unwrap().status,
            PairStatus::Unpaired
        );

        h.session.request_pairing().await;
        assert_eq!(h.session.status(), PairStatus::PairRequested);
        assert_eq!(recv(&mut h.peer).await, Message::pair(true));

        send(&mut h.peer, Message::pair(true)).await;
        wait_for(&h.session, PairStatus::Paired).await;

        assert!(h.store.get("phone-1").unwrap().trusts(&remote_identity().certificate));
        assert_eq!(
            h.registry.snapshot().get("phone-1").unwrap().status,
            PairStatus::Paired
        );
    }

    #[tokio::test]
    async fn test_request_then_peer_rejects() {
        let mut h = harness(Arc::new(MemoryDeviceStore::new()));
        h.session.request_pairing().await;
        recv(&mut h.peer).await;

        send(&mut h.peer, Message::pair(false)).await;
        wait_for(&h.session, PairStatus::Unpaired).await;
        assert!(h.store.get("phone-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_ignored() {
        let mut h = harness(Arc::new(MemoryDeviceStore::new()));
        h.session.request_pairing().await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(true));

        tokio::time::sleep(DEFAULT_PAIR_TIMEOUT + Duration::from_secs(1)).await;
        wait_for(&h.session, PairStatus::Unpaired).await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(false));

        send(&mut h.peer, Message::pair(true)).await;
        // Messages are handled in order, so once this is answered the late
        // reply has been consumed.
        send(&mut h.peer, Message::new(9, Component::DeviceIdentityQuery)).await;
        assert_eq!(recv(&mut h.peer).await.id, 9);

        assert_eq!(h.session.status(), PairStatus::Unpaired);
        assert!(h.store.get("phone-1").is_none());

        let mut timed_out = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, KuromeEvent::PairTimedOut { .. }) {
                timed_out = true;
            }
        }
        assert!(timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_request_after_late_reply_window_is_honoured() {
        let mut h = harness(Arc::new(MemoryDeviceStore::new()));
        h.session.request_pairing().await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(true));

        tokio::time::sleep(DEFAULT_PAIR_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(false));
        tokio::time::sleep(DEFAULT_PAIR_TIMEOUT + Duration::from_secs(1)).await;

        send(&mut h.peer, Message::pair(true)).await;
        wait_for(&h.session, PairStatus::PairRequestedByPeer).await;
    }

    #[tokio::test]
    async fn test_filesystem_is_gated_until_paired() {
        let mut h = harness(Arc::new(MemoryDeviceStore::new()));

        send(
            &mut h.peer,
            Message::new(
                2,
                Component::WriteFileCommand {
                    path: "/early.txt".into(),
                    offset: 0,
                    data: b"nope".to_vec(),
                },
            ),
        )
        .await;
        send(
            &mut h.peer,
            Message::new(
                3,
                Component::GetFileInfoQuery {
                    path: "/".into(),
                },
            ),
        )
        .await;
        send(&mut h.peer, Message::new(4, Component::DeviceIdentityQuery)).await;

        // The identity answer is the first thing to come back.
        let reply = recv(&mut h.peer).await;
        assert_eq!(reply.id, 4);
        assert!(matches!(
            reply.component,
            Component::DeviceIdentityResponse(_)
        ));
        assert!(!h.dir.path().join("early.txt").exists());

        send(&mut h.peer, Message::pair(true)).await;
        wait_for(&h.session, PairStatus::PairRequestedByPeer).await;
        assert!(matches!(
            h.events.recv().await.unwrap(),
            KuromeEvent::PairRequestedByPeer { .. }
        ));
        h.session.accept_pairing().await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(true));
        assert_eq!(h.session.status(), PairStatus::Paired);

        send(
            &mut h.peer,
            Message::new(
                5,
                Component::WriteFileCommand {
                    path: "/late.txt".into(),
                    offset: 0,
                    data: b"yes".to_vec(),
                },
            ),
        )
        .await;
        send(
            &mut h.peer,
            Message::new(
                6,
                Component::GetDirectoryQuery {
                    path: "/".into(),
                },
            ),
        )
        .await;
        let reply = recv(&mut h.peer).await;
        assert_eq!(reply.id, 6);
        match reply.component {
            Component::GetDirectoryResponse { node } => {
                let names: Vec<_> = node.children.iter().map(|c| c.info.filename.clone()).collect();
                assert_eq!(names, vec!["late.txt".to_string()]);
            }
            other => panic!("unexpected component: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_saved_certificate_starts_paired_and_unpair_forgets() {
        let store = Arc::new(MemoryDeviceStore::new());
        store
            .save(SavedDevice::from_identity(&remote_identity()))
            .unwrap();

        let mut h = harness(store);
        assert_eq!(h.session.status(), PairStatus::Paired);

        h.session.unpair().await;
        assert_eq!(recv(&mut h.peer).await, Message::pair(false));
        assert_eq!(h.session.status(), PairStatus::Unpaired);
        assert!(h.store.get("phone-1").is_none());
    }

    #[tokio::test]
    async fn test_mismatched_saved_certificate_starts_unpaired() {
        let store = Arc::new(MemoryDeviceStore::new());
        let mut other = remote_identity();
        other.certificate = CertificateDer::from(vec![0xCD; 32]);
        store.save(SavedDevice::from_identity(&other)).unwrap();

        let h = harness(store);
        assert_eq!(h.session.status(), PairStatus::Unpaired);
    }

    #[tokio::test]
    async fn test_disconnect_tears_down() {
        let h = harness(Arc::new(MemoryDeviceStore::new()));
        let session = h.session.clone();
        let mut events = h.events;

        drop(h.peer);
        h.run.await.unwrap();

        assert!(!session.link().is_connected());
        assert!(!h.registry.contains("phone-1"));
        assert!(h.registry.snapshot().is_empty());

        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, KuromeEvent::Disconnected { .. }) {
                disconnected = true;
            }
        }
        assert!(disconnected);
    }

    #[tokio::test]
    async fn test_second_registration_is_rejected() {
        let h = harness(Arc::new(MemoryDeviceStore::new()));
        let err = h.registry.register("phone-1", h.session.clone());
        assert!(err.is_err());
        assert!(h.registry.get("phone-1").is_some());
    }
}
