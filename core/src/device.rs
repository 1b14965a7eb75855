use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Platform {
    Android,
    Linux,
    Windows,
    MacOS,
    #[default]
    Unknown,
}

impl Platform {
    /// Platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else {
            Platform::Unknown
        }
    }
}

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub certificate: CertificateDer<'static>,
}

impl PeerIdentity {
    pub fn fingerprint(&self) -> String {
        crate::tls::fingerprint(&self.certificate)
    }
}

/// A peer that announced itself over UDP and can be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub role: String,
    pub id: String,
    pub name: String,
    pub address: SocketAddr,
}

/// A peer the user has paired with, as persisted by a
/// [`SavedDeviceStore`](crate::store::SavedDeviceStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub certificate_der: Vec<u8>,
    pub paired_at: u64,
}

impl SavedDevice {
    pub fn from_identity(peer: &PeerIdentity) -> Self {
        Self {
            id: peer.id.clone(),
            name: peer.name.clone(),
            platform: peer.platform,
            certificate_der: peer.certificate.as_ref().to_vec(),
            paired_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate_der.clone())
    }

    pub fn trusts(&self, certificate: &CertificateDer<'_>) -> bool {
        self.certificate_der.as_slice() == certificate.as_ref()
    }
}
