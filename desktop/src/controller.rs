use kurome_core::{KuromeEvent, KuromeService, PairStatus};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How the headless peer answers pairing without anyone at the keyboard.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairingPolicy {
    /// Accept every incoming pair request.
    pub auto_accept: bool,
    /// Ask every new unpaired peer to pair.
    pub request_on_connect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    RequestPairing { device_id: String },
    AcceptPairing { device_id: String },
    RejectPairing { device_id: String },
}

impl PairingPolicy {
    pub fn decide(&self, event: &KuromeEvent) -> Option<AppAction> {
        match event {
            KuromeEvent::SessionStarted {
                device_id, status, ..
            } if self.request_on_connect && *status == PairStatus::Unpaired => {
                Some(AppAction::RequestPairing {
                    device_id: device_id.clone(),
                })
            }
            KuromeEvent::PairRequestedByPeer { device_id, .. } => Some(if self.auto_accept {
                AppAction::AcceptPairing {
                    device_id: device_id.clone(),
                }
            } else {
                AppAction::RejectPairing {
                    device_id: device_id.clone(),
                }
            }),
            _ => None,
        }
    }
}

/// Logs service events and applies the pairing policy until the event
/// channel closes.
pub async fn run(
    service: Arc<KuromeService>,
    policy: PairingPolicy,
    mut events: broadcast::Receiver<KuromeEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        log_event(&event);
        if let Some(action) = policy.decide(&event) {
            apply(&service, action).await;
        }
    }
}

fn log_event(event: &KuromeEvent) {
    match event {
        KuromeEvent::CandidateFound(candidate) => {
            debug!("Found {} ({}) at {}", candidate.name, candidate.id, candidate.address);
        }
        KuromeEvent::SessionStarted {
            device_name,
            address,
            fingerprint,
            status,
            ..
        } => {
            info!(
                "Connected to {} at {} ({:?}), fingerprint {}",
                device_name, address, status, fingerprint
            );
        }
        KuromeEvent::ConnectionFailed { address, error } => {
            warn!("Connection with {} failed: {}", address, error);
        }
        KuromeEvent::PairRequestedByPeer {
            device_name,
            fingerprint,
            ..
        } => {
            info!(
                "{} wants to pair, fingerprint {}",
                device_name, fingerprint
            );
        }
        KuromeEvent::PairStatusChanged { device_id, status } => {
            info!("{} is now {:?}", device_id, status);
        }
        KuromeEvent::PairTimedOut { device_id } => {
            warn!("{} did not answer the pair request", device_id);
        }
        KuromeEvent::Disconnected { device_id } => info!("{} disconnected", device_id),
    }
}

async fn apply(service: &KuromeService, action: AppAction) {
    match action {
        AppAction::RequestPairing { device_id } => {
            if let Some(session) = service.session(&device_id) {
                session.request_pairing().await;
            }
        }
        AppAction::AcceptPairing { device_id } => {
            if let Some(session) = service.session(&device_id) {
                info!("Accepting pair request from {}", device_id);
                session.accept_pairing().await;
            }
        }
        AppAction::RejectPairing { device_id } => {
            if let Some(session) = service.session(&device_id) {
                info!(
                    "Rejecting pair request from {}; run with --auto-accept to allow pairing",
                    device_id
                );
                session.reject_pairing().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurome_core::Platform;

    fn started(status: PairStatus) -> KuromeEvent {
        KuromeEvent::SessionStarted {
            device_id: "phone".into(),
            device_name: "Phone".into(),
            platform: Platform::Android,
            address: "10.0.0.5:33587".parse().unwrap(),
            fingerprint: "ab".into(),
            status,
        }
    }

    fn pair_request() -> KuromeEvent {
        KuromeEvent::PairRequestedByPeer {
            device_id: "phone".into(),
            device_name: "Phone".into(),
            fingerprint: "ab".into(),
        }
    }

    #[test]
    fn test_default_policy_rejects_and_never_requests() {
        let policy = PairingPolicy::default();
        assert_eq!(policy.decide(&started(PairStatus::Unpaired)), None);
        assert_eq!(
            policy.decide(&pair_request()),
            Some(AppAction::RejectPairing {
                device_id: "phone".into()
            })
        );
    }

    #[test]
    fn test_eager_policy() {
        let policy = PairingPolicy {
            auto_accept: true,
            request_on_connect: true,
        };
        assert_eq!(
            policy.decide(&started(PairStatus::Unpaired)),
            Some(AppAction::RequestPairing {
                device_id: "phone".into()
            })
        );
        assert_eq!(policy.decide(&started(PairStatus::Paired)), None);
        assert_eq!(
            policy.decide(&pair_request()),
            Some(AppAction::AcceptPairing {
                device_id: "phone".into()
            })
        );
        assert_eq!(
            policy.decide(&KuromeEvent::Disconnected {
                device_id: "phone".into()
            }),
            None
        );
    }
}
