//! File access collaborator: read outgoing files, persist received ones.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nearfile_core::now_millis;

/// Read/persist capability used by the transfer engine.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Persist `bytes` under `name`; returns where it landed. Never overwrites.
    async fn save_file(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf>;
}

/// Saves into one download directory.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    dir: PathBuf,
}

impl FsFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Strip any directory part a peer put in the name.
fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        "received_file".to_string()
    } else {
        base.to_string()
    }
}

/// `photo.jpg` -> `photo_<millis>.jpg`
fn with_suffix(name: &str, millis: u64) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], millis, &name[dot..]),
        _ => format!("{name}_{millis}"),
    }
}

#[async_trait]
impl FileStore for FsFileStore {
    async fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn save_file(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = sanitize(name);
        let mut path = self.dir.join(&name);
        if tokio::fs::try_exists(&path).await? {
            path = self.dir.join(with_suffix(&name, now_millis()));
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), len = bytes.len(), "saved file");
        Ok(path)
    }
}
