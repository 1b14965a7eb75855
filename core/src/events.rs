use crate::device::{Candidate, Platform};
use crate::session::PairStatus;
use std::net::SocketAddr;

pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KuromeEvent {
    /// A peer announced itself and a connection attempt is starting
    CandidateFound(Candidate),
    /// Handshake and identity exchange finished; the session is live
    SessionStarted {
        device_id: String,
        device_name: String,
        platform: Platform,
        address: SocketAddr,
        fingerprint: String,
        status: PairStatus,
    },
    /// A connection attempt failed before a session existed
    ConnectionFailed { address: SocketAddr, error: String },
    /// The peer asked to pair and waits for accept_pairing/reject_pairing
    PairRequestedByPeer {
        device_id: String,
        device_name: String,
        fingerprint: String,
    },
    PairStatusChanged {
        device_id: String,
        status: PairStatus,
    },
    /// Our pair request got no answer in time
    PairTimedOut { device_id: String },
    Disconnected { device_id: String },
}
