use crate::error::{KuromeError, Result};
use crate::message::{END_OF_FILE_OFFSET, FileInfo, Node, SetAttributes};

/// Disk capacity reported in identity responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceInfo {
    pub total: u64,
    pub free: u64,
}

/// Filesystem primitives the dispatcher runs peer requests against. Paths are
/// as sent by the peer; implementations decide how they map onto disk.
pub trait FilesystemProvider: Send + Sync {
    fn create_file(&self, path: &str) -> Result<()>;
    fn create_directory(&self, path: &str) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
    fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;
    /// Returns the number of bytes written.
    fn write_file(&self, path: &str, offset: i64, data: &[u8]) -> Result<u64>;
    fn set_attributes(&self, attributes: &SetAttributes) -> Result<()>;
    fn read_file(&self, path: &str, offset: i64, length: u64) -> Result<Vec<u8>>;
    fn file_info(&self, path: &str) -> Result<FileInfo>;
    fn directory(&self, path: &str) -> Result<Node>;
    fn space(&self) -> Result<SpaceInfo>;
}

/// Maps a wire offset onto an absolute position in a file of `file_len`
/// bytes. `-1` is the end of the file; any other negative value is invalid.
pub fn resolve_offset(offset: i64, file_len: u64) -> Result<u64> {
    match offset {
        END_OF_FILE_OFFSET => Ok(file_len),
        o if o < 0 => Err(KuromeError::Filesystem(format!("Invalid offset {}", o))),
        o => Ok(o as u64),
    }
}
