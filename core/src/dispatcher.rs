use crate::filesystem::{FilesystemProvider, SpaceInfo};
use crate::message::{Component, DeviceIdentityResponse, Message};
use crate::security::IdentityProvider;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest `ReadFileQuery` served in one response.
pub const DEFAULT_MAX_READ_LENGTH: u64 = 4 * 1024 * 1024;

/// Turns one incoming message into at most one reply.
///
/// Queries always get an answer carrying the request id, either the result
/// or a `FailResponse`. Commands are performed silently; their failures are
/// only logged. All filesystem work is blocking and must run off the async
/// runtime.
pub struct CommandDispatcher {
    fs: Arc<dyn FilesystemProvider>,
    identity: Arc<dyn IdentityProvider>,
    max_read_length: u64,
}

impl CommandDispatcher {
    pub fn new(fs: Arc<dyn FilesystemProvider>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            fs,
            identity,
            max_read_length: DEFAULT_MAX_READ_LENGTH,
        }
    }

    pub fn with_max_read_length(mut self, max_read_length: u64) -> Self {
        self.max_read_length = max_read_length;
        self
    }

    /// The identity answer for a `DeviceIdentityQuery` with the given id.
    pub fn identity_response(&self, id: i64) -> Message {
        let space = self.fs.space().unwrap_or_else(|e| {
            debug!("Disk space unavailable: {}", e);
            SpaceInfo::default()
        });
        Message::new(
            id,
            Component::DeviceIdentityResponse(DeviceIdentityResponse {
                total_space: space.total,
                free_space: space.free,
                name: self.identity.local_name(),
                id: self.identity.local_id(),
                extra: whoami::distro(),
                platform: self.identity.local_platform(),
            }),
        )
    }

    pub fn dispatch(&self, message: &Message) -> Option<Message> {
        let id = message.id;
        match &message.component {
            Component::DeviceIdentityQuery => Some(self.identity_response(id)),

            Component::ReadFileQuery {
                path,
                offset,
                length,
            } => Some(self.read_file(id, path, *offset, *length)),
            Component::GetFileInfoQuery { path } => Some(match self.fs.file_info(path) {
                Ok(info) => Message::new(id, Component::GetFileInfoResponse { info }),
                Err(e) => self.fail(id, "GetFileInfo", path, e),
            }),
            Component::GetDirectoryQuery { path } => Some(match self.fs.directory(path) {
                Ok(node) => Message::new(id, Component::GetDirectoryResponse { node }),
                Err(e) => self.fail(id, "GetDirectory", path, e),
            }),

            Component::CreateFileCommand { path } => {
                self.command("CreateFile", path, self.fs.create_file(path))
            }
            Component::CreateDirectoryCommand { path } => {
                self.command("CreateDirectory", path, self.fs.create_directory(path))
            }
            Component::DeleteFileCommand { path } => {
                self.command("DeleteFile", path, self.fs.delete(path))
            }
            Component::RenameFileCommand { old_path, new_path } => self.command(
                "RenameFile",
                old_path,
                self.fs.rename(old_path, new_path),
            ),
            Component::WriteFileCommand { path, offset, data } => self.command(
                "WriteFile",
                path,
                self.fs.write_file(path, *offset, data).map(|_| ()),
            ),
            Component::SetAttributesCommand(attributes) => self.command(
                "SetAttributes",
                &attributes.path,
                self.fs.set_attributes(attributes),
            ),

            other => {
                debug!(
                    "No handler for {:?} (id={})",
                    other.component_type(),
                    message.id
                );
                None
            }
        }
    }

    fn read_file(&self, id: i64, path: &str, offset: i64, length: i64) -> Message {
        if length < 0 {
            return Message::fail(id, format!("Invalid read length {}", length));
        }
        let length = length as u64;
        if length > self.max_read_length {
            return Message::fail(
                id,
                format!(
                    "Read of {} bytes exceeds limit of {} bytes",
                    length, self.max_read_length
                ),
            );
        }

        match self.fs.read_file(path, offset, length) {
            Ok(data) => Message::new(
                id,
                Component::ReadFileResponse {
                    path: path.to_string(),
                    offset,
                    length: data.len() as i64,
                    data,
                },
            ),
            Err(e) => self.fail(id, "ReadFile", path, e),
        }
    }

    fn fail(&self, id: i64, operation: &str, path: &str, error: impl std::fmt::Display) -> Message {
        debug!("{} {} failed: {}", operation, path, error);
        Message::fail(id, error.to_string())
    }

    fn command(
        &self,
        operation: &str,
        path: &str,
        result: crate::error::Result<()>,
    ) -> Option<Message> {
        if let Err(e) = result {
            warn!("{} {} failed: {}", operation, path, e);
        }
        None
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("max_read_length", &self.max_read_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;
    use crate::local_fs::LocalFilesystem;
    use crate::security::KeyStore;

    fn dispatcher() -> (tempfile::TempDir, CommandDispatcher, Arc<KeyStore>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(LocalFilesystem::new(dir.path()).unwrap());
        let keys = Arc::new(KeyStore::ephemeral("Desk".into(), Platform::Linux).unwrap());
        let dispatcher = CommandDispatcher::new(fs, keys.clone()).with_max_read_length(16);
        (dir, dispatcher, keys)
    }

    #[test]
    fn test_identity_query_echoes_id() {
        let (_dir, dispatcher, keys) = dispatcher();
        let reply = dispatcher
            .dispatch(&Message::new(-7, Component::DeviceIdentityQuery))
            .unwrap();
        assert_eq!(reply.id, -7);
        match reply.component {
            Component::DeviceIdentityResponse(identity) => {
                assert_eq!(identity.id, keys.local_id());
                assert_eq!(identity.name, "Desk");
                assert_eq!(identity.platform, Platform::Linux);
            }
            other => panic!("unexpected component: {:?}", other),
        }
    }

    #[test]
    fn test_commands_are_silent_and_queries_answer() {
        let (dir, dispatcher, _) = dispatcher();

        let write = Message::new(
            3,
            Component::WriteFileCommand {
                path: "/notes.txt".into(),
                offset: 0,
                data: b"hello".to_vec(),
            },
        );
        assert!(dispatcher.dispatch(&write).is_none());
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"hello");

        let read = Message::new(
            4,
            Component::ReadFileQuery {
                path: "/notes.txt".into(),
                offset: 1,
                length: 3,
            },
        );
        let reply = dispatcher.dispatch(&read).unwrap();
        assert_eq!(reply.id, 4);
        assert_eq!(
            reply.component,
            Component::ReadFileResponse {
                path: "/notes.txt".into(),
                offset: 1,
                length: 3,
                data: b"ell".to_vec(),
            }
        );
    }

    #[test]
    fn test_failures() {
        let (_dir, dispatcher, _) = dispatcher();

        // Failed command: still silent.
        let delete = Message::new(
            5,
            Component::DeleteFileCommand {
                path: "/missing".into(),
            },
        );
        assert!(dispatcher.dispatch(&delete).is_none());

        let info = Message::new(
            6,
            Component::GetFileInfoQuery {
                path: "/missing".into(),
            },
        );
        let reply = dispatcher.dispatch(&info).unwrap();
        assert_eq!(reply.id, 6);
        assert!(matches!(reply.component, Component::FailResponse { .. }));

        let too_big = Message::new(
            8,
            Component::ReadFileQuery {
                path: "/missing".into(),
                offset: 0,
                length: 17,
            },
        );
        let reply = dispatcher.dispatch(&too_big).unwrap();
        assert_eq!(reply.id, 8);
        assert!(matches!(reply.component, Component::FailResponse { .. }));
    }

    #[test]
    fn test_responses_are_not_handled() {
        let (_dir, dispatcher, _) = dispatcher();
        assert!(dispatcher.dispatch(&Message::fail(9, "nope")).is_none());
        assert!(dispatcher.dispatch(&Message::pair(true)).is_none());
    }
}
