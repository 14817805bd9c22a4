//! Content-addressable file store.
//!
//! Every file lives at `<root>/<namespace>/<path from PathKey>`. The namespace
//! is the id of the node that originated the file, so replicas received from
//! different peers never collide on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::cipher::{self, CipherError};
use crate::{DEFAULT_STORAGE_ROOT, IV_SIZE};

/// Hex characters per directory level.
const SEGMENT_WIDTH: usize = 8;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key {key:?} not found in namespace {namespace:?}")]
    NotFound { namespace: String, key: String },
    #[error("decrypt while storing failed: {0}")]
    Cipher(#[from] CipherError),
    #[error("stream ended early: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk location of a logical key, relative to its namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory components, outermost first.
    pub segments: Vec<String>,
    /// File name.
    pub full_digest: String,
    /// Unit of deletion: everything below this directory goes together.
    pub root_segment: String,
}

impl PathKey {
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir().join(&self.full_digest)
    }
}

pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

/// SHA-1 the key and nest the hex digest in 8-character directories:
/// `bef06e07/b129dc25/191b1ccf/fffb0f6d/05e64125/bef06e07...`.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<String> = (0..digest.len() / SEGMENT_WIDTH)
        .map(|i| digest[i * SEGMENT_WIDTH..(i + 1) * SEGMENT_WIDTH].to_string())
        .collect();
    let root_segment = segments.first().cloned().unwrap_or_default();

    PathKey {
        segments,
        full_digest: digest,
        root_segment,
    }
}

/// Store the key verbatim as `<key>/<key>`.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        segments: vec![key.to_string()],
        full_digest: key.to_string(),
        root_segment: key.to_string(),
    }
}

pub struct StoreConfig {
    /// Falls back to `DEFAULT_STORAGE_ROOT` when empty.
    pub root: PathBuf,
    /// Falls back to [`default_path_transform`] when unset.
    pub path_transform: Option<PathTransform>,
}

pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let root = if config.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_STORAGE_ROOT)
        } else {
            config.root
        };
        let path_transform: PathTransform = match config.path_transform {
            Some(transform) => transform,
            None => Arc::new(default_path_transform),
        };

        Store {
            root,
            path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    pub fn full_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(self.path_key(key).file_path())
    }

    /// Stat errors other than not-found are logged and reported as absent.
    pub async fn present(&self, namespace: &str, key: &str) -> bool {
        let path = self.full_path(namespace, key);
        match fs::metadata(&path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!("stat {} failed, treating as absent: {}", path.display(), e);
                false
            }
        }
    }

    /// Write the whole stream to disk, replacing any previous content.
    ///
    /// Bytes land in a staging file next to the target, which only takes the
    /// key's place once the copy has finished. A failed copy leaves the
    /// previous content, if any, untouched.
    pub async fn write<R>(&self, namespace: &str, key: &str, mut reader: R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (mut file, staged) = self.create(namespace, key).await?;
        let copied = async {
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok::<u64, StoreError>(written)
        }
        .await;
        drop(file);

        let written = staged.settle(copied).await?;
        debug!("written {} bytes to disk for key {:?} in {}", written, key, namespace);
        Ok(written)
    }

    /// Same as [`Store::write`] but decrypts the stream on the way to disk.
    pub async fn write_decrypt<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        self.decrypt_into(namespace, key, encryption_key, reader, None).await
    }

    /// Decrypt exactly `ciphertext_len` bytes of `reader` to disk.
    ///
    /// Nothing is stored unless every byte arrives; a short stream is a
    /// [`StoreError::Truncated`].
    pub async fn write_decrypt_exact<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        reader: R,
        ciphertext_len: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let limited = reader.take(ciphertext_len);
        self.decrypt_into(namespace, key, encryption_key, limited, Some(ciphertext_len)).await
    }

    async fn decrypt_into<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        reader: R,
        ciphertext_len: Option<u64>,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        cipher::check_key(encryption_key)?;

        let (mut file, staged) = self.create(namespace, key).await?;
        let decrypted = async {
            let written = cipher::decrypt(encryption_key, reader, &mut file).await?;
            if let Some(expected) = ciphertext_len {
                let received = written + IV_SIZE as u64;
                if received != expected {
                    return Err(StoreError::Truncated { expected, actual: received });
                }
            }
            Ok::<u64, StoreError>(written)
        }
        .await;
        drop(file);

        let written = staged.settle(decrypted).await?;
        debug!("decrypted {} bytes to disk for key {:?} in {}", written, key, namespace);
        Ok(written)
    }

    /// Open a stored file. Returns its size alongside the handle; the handle
    /// is closed when dropped.
    pub async fn read(&self, namespace: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.full_path(namespace, key);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        Ok((size, file))
    }

    /// Remove the whole directory tree under the key's root segment.
    ///
    /// This is coarser than one key: any other key whose path starts with the
    /// same root segment in this namespace is removed too.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key);
        let path = self.root.join(namespace).join(&path_key.root_segment);

        remove_tree(&path).await?;
        debug!("deleted [{}] from disk", path_key.full_digest);
        Ok(())
    }

    /// Remove every namespace under the root.
    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_tree(&self.root).await?;
        Ok(())
    }

    /// Find a namespace holding `key`, if any.
    pub async fn locate(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(namespace) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.present(&namespace, key).await {
                return Ok(Some(namespace));
            }
        }

        Ok(None)
    }

    async fn create(&self, namespace: &str, key: &str) -> Result<(BufWriter<File>, Staged), StoreError> {
        let path_key = self.path_key(key);
        let dir = self.root.join(namespace).join(path_key.dir());
        fs::create_dir_all(&dir).await?;

        let staged = Staged {
            temp: dir.join(format!("{}.{:016x}.partial", path_key.full_digest, rand::random::<u64>())),
            target: dir.join(&path_key.full_digest),
        };
        let file = File::create(&staged.temp).await?;
        Ok((BufWriter::new(file), staged))
    }
}

/// A write in progress, kept apart from the key's real path.
struct Staged {
    temp: PathBuf,
    target: PathBuf,
}

impl Staged {
    /// Move the staged file into place on success, discard it otherwise.
    async fn settle(self, outcome: Result<u64, StoreError>) -> Result<u64, StoreError> {
        match outcome {
            Ok(written) => {
                fs::rename(&self.temp, &self.target).await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(remove) = fs::remove_file(&self.temp).await {
                    warn!("failed to remove {}: {}", self.temp.display(), remove);
                }
                Err(e)
            }
        }
    }
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
