use crate::device::Platform;
use crate::error::{KuromeError, Result};
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const IDENTITY_FILE: &str = "identity.json";

/// Supplies the local TLS identity.
pub trait SecurityProvider: Send + Sync {
    fn identity_certificate(&self) -> CertificateDer<'static>;
    fn key_pair(&self) -> PrivatePkcs8KeyDer<'static>;
}

/// Supplies who we are to peers.
pub trait IdentityProvider: Send + Sync {
    fn local_id(&self) -> String;
    fn local_name(&self) -> String;

    fn local_platform(&self) -> Platform {
        Platform::current()
    }
}

/// Self-signed certificate, private key and installation id.
///
/// The id is generated once and persisted next to the key material; it never
/// changes afterwards.
#[derive(Debug)]
pub struct KeyStore {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    device_id: String,
    device_name: String,
    platform: Platform,
    storage_dir: Option<PathBuf>,
}

impl KeyStore {
    /// Loads the identity from `storage_dir`, creating it on first run.
    pub fn open(storage_dir: &Path, device_name: String, platform: Platform) -> Result<Self> {
        if !storage_dir.exists() {
            std::fs::create_dir_all(storage_dir).map_err(KuromeError::Io)?;
        }

        // Other users must not be able to read the private key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            if let Err(e) = std::fs::set_permissions(storage_dir, perms) {
                warn!("Failed to set storage directory permissions: {}", e);
            }
        }

        let (cert, key, device_id) = Self::load_or_create_identity(storage_dir)?;
        info!("Local identity loaded (id={})", device_id);

        Ok(Self {
            cert,
            key,
            device_id,
            device_name,
            platform,
            storage_dir: Some(storage_dir.to_path_buf()),
        })
    }

    /// A fresh identity that is never written to disk.
    pub fn ephemeral(device_name: String, platform: Platform) -> Result<Self> {
        let (cert_der, key_der) = generate_identity()?;
        Ok(Self {
            cert: CertificateDer::from(cert_der),
            key: PrivatePkcs8KeyDer::from(key_der),
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name,
            platform,
            storage_dir: None,
        })
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    pub fn fingerprint(&self) -> String {
        crate::tls::fingerprint(&self.cert)
    }

    #[cfg(unix)]
    fn check_identity_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    "Identity file {:?} has overly permissive permissions ({:o}). \
                     Expected 0600 (owner-only). Consider running: chmod 600 {:?}",
                    path, mode, path
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn check_identity_permissions(_path: &Path) {}

    fn load_or_create_identity(
        storage_dir: &Path,
    ) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>, String)> {
        let identity_path = storage_dir.join(IDENTITY_FILE);

        if identity_path.exists() {
            Self::check_identity_permissions(&identity_path);
            let data = std::fs::read(&identity_path).map_err(KuromeError::Io)?;
            let persisted: PersistedIdentity = serde_json::from_slice(&data).map_err(|e| {
                KuromeError::InitializationError(format!("Failed to parse identity: {}", e))
            })?;
            if persisted.device_id.is_empty() {
                return Err(KuromeError::InitializationError(
                    "Identity file has no device id".to_string(),
                ));
            }
            return Ok((
                CertificateDer::from(persisted.cert_der),
                PrivatePkcs8KeyDer::from(persisted.key_der),
                persisted.device_id,
            ));
        }

        info!("No identity found, generating new one...");
        let (cert_der, key_der) = generate_identity()?;
        let device_id = uuid::Uuid::new_v4().to_string();

        let persisted = PersistedIdentity {
            cert_der: cert_der.clone(),
            key_der: key_der.clone(),
            device_id: device_id.clone(),
        };
        let data = serde_json::to_vec_pretty(&persisted)?;
        write_private_file(&identity_path, &data)?;

        Ok((
            CertificateDer::from(cert_der),
            PrivatePkcs8KeyDer::from(key_der),
            device_id,
        ))
    }
}

impl SecurityProvider for KeyStore {
    fn identity_certificate(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    fn key_pair(&self) -> PrivatePkcs8KeyDer<'static> {
        self.key.clone_key()
    }
}

impl IdentityProvider for KeyStore {
    fn local_id(&self) -> String {
        self.device_id.clone()
    }

    fn local_name(&self) -> String {
        self.device_name.clone()
    }

    fn local_platform(&self) -> Platform {
        self.platform
    }
}

fn generate_identity() -> Result<(Vec<u8>, Vec<u8>)> {
    let CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(vec!["kurome.local".to_string(), "localhost".to_string()])?;
    Ok((cert.der().to_vec(), signing_key.serialize_der()))
}

/// Atomic owner-only write: temp file, fsync, rename.
pub(crate) fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, data).map_err(KuromeError::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms).map_err(KuromeError::Io)?;
    }

    {
        let f = std::fs::File::open(&tmp_path).map_err(KuromeError::Io)?;
        f.sync_all().map_err(KuromeError::Io)?;
    }

    std::fs::rename(&tmp_path, path).map_err(KuromeError::Io)?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    #[serde(default)]
    device_id: String,
}
