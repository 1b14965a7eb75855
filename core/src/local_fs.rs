use crate::error::{KuromeError, Result};
use crate::filesystem::{FilesystemProvider, SpaceInfo, resolve_offset};
use crate::message::{FileInfo, FileType, Node, SetAttributes};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Serves one directory tree. Peer paths are interpreted relative to the
/// root and may not escape it.
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
    root_canonical: PathBuf,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KuromeError::Filesystem(format!(
                "Shared root {} is not a directory",
                root.display()
            )));
        }
        let root_canonical = root.canonicalize().map_err(KuromeError::Io)?;
        Ok(Self {
            root,
            root_canonical,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a peer path to the canonical on-disk path that every operation
    /// then uses, so the containment check and the operation see the same
    /// path.
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = path.trim_start_matches(['/', '\\']);
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(KuromeError::Filesystem(format!("Invalid path: {}", path)));
        }

        let full_path = self.root_canonical.join(relative);

        // Canonicalize the deepest existing ancestor and re-append the rest.
        let mut existing = full_path.as_path();
        let mut missing = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut canonical = existing.canonicalize().map_err(KuromeError::Io)?;
        for name in missing.into_iter().rev() {
            canonical.push(name);
        }

        if !canonical.starts_with(&self.root_canonical) {
            return Err(KuromeError::Filesystem(format!("Path escapes root: {}", path)));
        }
        Ok(canonical)
    }

    fn info_for(&self, full_path: &Path) -> Result<FileInfo> {
        let metadata = fs::symlink_metadata(full_path).map_err(KuromeError::Io)?;

        let filename = full_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let file_type = if metadata.is_symlink() {
            FileType::Symlink
        } else if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_file() {
            FileType::File
        } else {
            FileType::Unknown
        };

        Ok(FileInfo {
            filename,
            file_type,
            length: if metadata.is_dir() { 0 } else { metadata.len() },
            creation_time: to_millis(metadata.created().ok()),
            last_access_time: to_millis(metadata.accessed().ok()),
            last_write_time: to_millis(metadata.modified().ok()),
        })
    }
}

impl FilesystemProvider for LocalFilesystem {
    fn create_file(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full_path)
            .map_err(KuromeError::Io)?;
        debug!("Created file {}", full_path.display());
        Ok(())
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::create_dir_all(&full_path).map_err(KuromeError::Io)?;
        debug!("Created directory {}", full_path.display());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        if full_path == self.root_canonical {
            return Err(KuromeError::Filesystem(
                "Refusing to delete the shared root".to_string(),
            ));
        }
        let metadata = fs::symlink_metadata(&full_path).map_err(KuromeError::Io)?;
        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).map_err(KuromeError::Io)?;
        } else {
            fs::remove_file(&full_path).map_err(KuromeError::Io)?;
        }
        debug!("Deleted {}", full_path.display());
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let from = self.resolve_path(old_path)?;
        let to = self.resolve_path(new_path)?;
        fs::rename(&from, &to).map_err(KuromeError::Io)?;
        debug!("Renamed {} -> {}", from.display(), to.display());
        Ok(())
    }

    fn write_file(&self, path: &str, offset: i64, data: &[u8]) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full_path)
            .map_err(KuromeError::Io)?;

        let len = file.metadata().map_err(KuromeError::Io)?.len();
        let position = resolve_offset(offset, len)?;
        file.seek(SeekFrom::Start(position))
            .map_err(KuromeError::Io)?;
        file.write_all(data).map_err(KuromeError::Io)?;
        trace!(
            "Wrote {} bytes to {} at {}",
            data.len(),
            full_path.display(),
            position
        );
        Ok(data.len() as u64)
    }

    fn set_attributes(&self, attributes: &SetAttributes) -> Result<()> {
        let full_path = self.resolve_path(&attributes.path)?;
        let metadata = fs::metadata(&full_path).map_err(KuromeError::Io)?;

        let file = if metadata.is_dir() {
            File::open(&full_path).map_err(KuromeError::Io)?
        } else {
            OpenOptions::new()
                .write(true)
                .open(&full_path)
                .map_err(KuromeError::Io)?
        };

        if attributes.length >= 0 && metadata.is_file() {
            file.set_len(attributes.length as u64)
                .map_err(KuromeError::Io)?;
        }

        let mut times = fs::FileTimes::new();
        let mut changed = false;
        if let Some(t) = from_millis(attributes.last_access_time) {
            times = times.set_accessed(t);
            changed = true;
        }
        if let Some(t) = from_millis(attributes.last_write_time) {
            times = times.set_modified(t);
            changed = true;
        }
        if let Some(t) = from_millis(attributes.creation_time) {
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileTimesExt;
                times = times.set_created(t);
                changed = true;
            }
            #[cfg(target_os = "macos")]
            {
                use std::os::macos::fs::FileTimesExt;
                times = times.set_created(t);
                changed = true;
            }
            #[cfg(not(any(windows, target_os = "macos")))]
            trace!(
                "Creation time {:?} not settable on this platform for {}",
                t,
                full_path.display()
            );
        }
        if changed {
            file.set_times(times).map_err(KuromeError::Io)?;
        }
        Ok(())
    }

    fn read_file(&self, path: &str, offset: i64, length: u64) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;

        // Regular files only; no device nodes, sockets or FIFOs.
        let metadata = fs::symlink_metadata(&full_path).map_err(KuromeError::Io)?;
        if !metadata.is_file() {
            return Err(KuromeError::Filesystem(format!(
                "Not a regular file: {}",
                full_path.display()
            )));
        }

        let mut file = File::open(&full_path).map_err(KuromeError::Io)?;
        let position = resolve_offset(offset, metadata.len())?;
        file.seek(SeekFrom::Start(position))
            .map_err(KuromeError::Io)?;

        let capacity = usize::try_from(length.min(metadata.len().saturating_sub(position)))
            .map_err(|_| KuromeError::Filesystem("Read size is too large".to_string()))?;
        let mut buffer = Vec::with_capacity(capacity);
        file.take(length)
            .read_to_end(&mut buffer)
            .map_err(KuromeError::Io)?;
        Ok(buffer)
    }

    fn file_info(&self, path: &str) -> Result<FileInfo> {
        let full_path = self.resolve_path(path)?;
        self.info_for(&full_path)
    }

    fn directory(&self, path: &str) -> Result<Node> {
        let full_path = self.resolve_path(path)?;
        let info = self.info_for(&full_path)?;
        if info.file_type != FileType::Directory {
            return Err(KuromeError::Filesystem(format!(
                "Not a directory: {}",
                full_path.display()
            )));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&full_path).map_err(KuromeError::Io)? {
            let entry = entry.map_err(KuromeError::Io)?;
            match self.info_for(&entry.path()) {
                Ok(info) => children.push(Node {
                    info,
                    children: Vec::new(),
                }),
                Err(e) => trace!("Skipping {}: {}", entry.path().display(), e),
            }
        }
        children.sort_by(|a, b| a.info.filename.cmp(&b.info.filename));

        Ok(Node { info, children })
    }

    fn space(&self) -> Result<SpaceInfo> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| self.root_canonical.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| SpaceInfo {
                total: disk.total_space(),
                free: disk.available_space(),
            })
            .ok_or_else(|| {
                KuromeError::Filesystem(format!(
                    "No disk found for {}",
                    self.root_canonical.display()
                ))
            })
    }
}

fn to_millis(time: Option<SystemTime>) -> i64 {
    match time {
        Some(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        },
        None => 0,
    }
}

fn from_millis(millis: i64) -> Option<SystemTime> {
    match millis {
        0 => None,
        m if m > 0 => Some(UNIX_EPOCH + Duration::from_millis(m as u64)),
        m => UNIX_EPOCH.checked_sub(Duration::from_millis(m.unsigned_abs())),
    }
}
