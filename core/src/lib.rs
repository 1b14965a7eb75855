pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod frame;
pub mod link;
pub mod local_fs;
pub mod message;
pub mod registry;
pub mod security;
pub mod service;
pub mod session;
pub mod store;
pub mod tls;

pub use config::KuromeConfig;
pub use device::{Candidate, PeerIdentity, Platform, SavedDevice};
pub use discovery::{Announcement, Discovery, DiscoveryConfig};
pub use dispatcher::CommandDispatcher;
pub use error::{KuromeError, Result};
pub use events::KuromeEvent;
pub use filesystem::{FilesystemProvider, SpaceInfo};
pub use link::{Link, LinkError, LinkEvent};
pub use local_fs::LocalFilesystem;
pub use message::{Component, ComponentType, FileInfo, FileType, Message, Node, SetAttributes};
pub use registry::{SessionRegistry, SessionSnapshot};
pub use security::{IdentityProvider, KeyStore, SecurityProvider};
pub use service::KuromeService;
pub use session::{DeviceSession, PairStatus, SessionHandle};
pub use store::{JsonDeviceStore, MemoryDeviceStore, SavedDeviceStore};
pub use tls::{HandshakeRole, SecureChannel, SecureChannelFactory};
