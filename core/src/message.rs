//! Messages carried inside frames.
//!
//! A [`Message`] is a tagged union of [`Component`]s plus an `i64` correlation
//! id. Responses carry the id of the request they answer. Negative ids mark
//! messages that expect no matching response; every `Pair` message uses
//! [`PAIR_MESSAGE_ID`].

use crate::device::Platform;
use serde::{Deserialize, Serialize};

/// Correlation id used by every `Pair` message.
pub const PAIR_MESSAGE_ID: i64 = -1;

/// Offset value meaning "the current end of the file".
pub const END_OF_FILE_OFFSET: i64 = -1;

/// Room for the envelope, the path and the other fields around file data.
pub const MESSAGE_OVERHEAD: usize = 64 * 1024;

/// Largest encoded message that can carry `max_data_len` bytes of file data.
pub const fn max_encoded_len(max_data_len: usize) -> usize {
    max_data_len.div_ceil(3) * 4 + MESSAGE_OVERHEAD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Component {
    DeviceIdentityQuery,
    DeviceIdentityResponse(DeviceIdentityResponse),
    Pair {
        accept: bool,
    },
    CreateFileCommand {
        path: String,
    },
    CreateDirectoryCommand {
        path: String,
    },
    DeleteFileCommand {
        path: String,
    },
    RenameFileCommand {
        old_path: String,
        new_path: String,
    },
    WriteFileCommand {
        path: String,
        offset: i64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    SetAttributesCommand(SetAttributes),
    ReadFileQuery {
        path: String,
        offset: i64,
        length: i64,
    },
    ReadFileResponse {
        path: String,
        offset: i64,
        length: i64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    GetFileInfoQuery {
        path: String,
    },
    GetFileInfoResponse {
        info: FileInfo,
    },
    GetDirectoryQuery {
        path: String,
    },
    GetDirectoryResponse {
        node: Node,
    },
    FailResponse {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentityResponse {
    pub total_space: u64,
    pub free_space: u64,
    pub name: String,
    pub id: String,
    pub extra: String,
    pub platform: Platform,
}

/// Attribute changes for one path. Times are Unix milliseconds; `0` leaves a
/// time unchanged and a negative `length` leaves the size unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttributes {
    pub path: String,
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub file_type: FileType,
    pub length: u64,
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
}

/// Directory tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub info: FileInfo,
    #[serde(default)]
    pub children: Vec<Node>,
}

/// The `componentType` tag of a [`Component`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    DeviceIdentityQuery,
    DeviceIdentityResponse,
    Pair,
    CreateFileCommand,
    CreateDirectoryCommand,
    DeleteFileCommand,
    RenameFileCommand,
    WriteFileCommand,
    SetAttributesCommand,
    ReadFileQuery,
    ReadFileResponse,
    GetFileInfoQuery,
    GetFileInfoResponse,
    GetDirectoryQuery,
    GetDirectoryResponse,
    FailResponse,
}

/// Which handler a component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Identity,
    Pair,
    Filesystem,
    /// Responses and anything else no local handler consumes.
    Unhandled,
}

impl ComponentType {
    pub fn handler(&self) -> HandlerKind {
        match self {
            ComponentType::DeviceIdentityQuery => HandlerKind::Identity,
            ComponentType::Pair => HandlerKind::Pair,
            ComponentType::CreateFileCommand
            | ComponentType::CreateDirectoryCommand
            | ComponentType::DeleteFileCommand
            | ComponentType::RenameFileCommand
            | ComponentType::WriteFileCommand
            | ComponentType::SetAttributesCommand
            | ComponentType::ReadFileQuery
            | ComponentType::GetFileInfoQuery
            | ComponentType::GetDirectoryQuery => HandlerKind::Filesystem,
            ComponentType::DeviceIdentityResponse
            | ComponentType::ReadFileResponse
            | ComponentType::GetFileInfoResponse
            | ComponentType::GetDirectoryResponse
            | ComponentType::FailResponse => HandlerKind::Unhandled,
        }
    }
}

impl Component {
    pub fn component_type(&self) -> ComponentType {
        match self {
            Component::DeviceIdentityQuery => ComponentType::DeviceIdentityQuery,
            Component::DeviceIdentityResponse(_) => ComponentType::DeviceIdentityResponse,
            Component::Pair { .. } => ComponentType::Pair,
            Component::CreateFileCommand { .. } => ComponentType::CreateFileCommand,
            Component::CreateDirectoryCommand { .. } => ComponentType::CreateDirectoryCommand,
            Component::DeleteFileCommand { .. } => ComponentType::DeleteFileCommand,
            Component::RenameFileCommand { .. } => ComponentType::RenameFileCommand,
            Component::WriteFileCommand { .. } => ComponentType::WriteFileCommand,
            Component::SetAttributesCommand(_) => ComponentType::SetAttributesCommand,
            Component::ReadFileQuery { .. } => ComponentType::ReadFileQuery,
            Component::ReadFileResponse { .. } => ComponentType::ReadFileResponse,
            Component::GetFileInfoQuery { .. } => ComponentType::GetFileInfoQuery,
            Component::GetFileInfoResponse { .. } => ComponentType::GetFileInfoResponse,
            Component::GetDirectoryQuery { .. } => ComponentType::GetDirectoryQuery,
            Component::GetDirectoryResponse { .. } => ComponentType::GetDirectoryResponse,
            Component::FailResponse { .. } => ComponentType::FailResponse,
        }
    }
}

impl Message {
    pub fn new(id: i64, component: Component) -> Self {
        Self { id, component }
    }

    pub fn pair(accept: bool) -> Self {
        Self::new(PAIR_MESSAGE_ID, Component::Pair { accept })
    }

    pub fn fail(id: i64, reason: impl Into<String>) -> Self {
        Self::new(
            id,
            Component::FailResponse {
                reason: reason.into(),
            },
        )
    }

    pub fn component_type(&self) -> ComponentType {
        self.component.component_type()
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

// File contents travel as base64 strings instead of JSON number arrays.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
