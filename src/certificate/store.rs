use crate::errors::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const ROOT_FILE_NAME: &str = "rootCert.pem";
const LEAF_DIRECTORY: &str = "crts";

/// Persistent storage for the root and minted leaves.
///
/// Every entry is a PEM container holding the certificate followed by its
/// private key.
#[async_trait]
pub trait CertificateCache: Send + Sync {
  /// Stored root, if any.
  async fn load_root(&self) -> Result<Option<String>>;
  /// Store the root.
  async fn save_root(&self, pem: &str) -> Result<()>;
  /// Stored leaf for `subject`, if any.
  async fn load_leaf(&self, subject: &str) -> Result<Option<String>>;
  /// Store the leaf for `subject`.
  async fn save_leaf(&self, subject: &str, pem: &str) -> Result<()>;
  /// Remove every stored leaf.
  async fn clear(&self) -> Result<()>;
}

/// Stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCertificateCache;

#[async_trait]
impl CertificateCache for NoopCertificateCache {
  async fn load_root(&self) -> Result<Option<String>> {
    Ok(None)
  }
  async fn save_root(&self, _pem: &str) -> Result<()> {
    Ok(())
  }
  async fn load_leaf(&self, _subject: &str) -> Result<Option<String>> {
    Ok(None)
  }
  async fn save_leaf(&self, _subject: &str, _pem: &str) -> Result<()> {
    Ok(())
  }
  async fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// Stores certificates as files under a directory.
#[derive(Debug, Clone)]
pub struct DiskCertificateCache {
  root: PathBuf,
}

impl DiskCertificateCache {
  /// Use `root` as the storage directory. It is created on first write.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    DiskCertificateCache { root: root.into() }
  }
  /// Path of the root certificate file, for installing it on clients.
  pub fn root_path(&self) -> PathBuf {
    self.root.join(ROOT_FILE_NAME)
  }
  fn leaf_path(&self, subject: &str) -> PathBuf {
    self
      .root
      .join(LEAF_DIRECTORY)
      .join(format!("{}.pem", sanitize(subject)))
  }
}

/// File name for a subject. `*` is not portable in file names.
pub(crate) fn sanitize(subject: &str) -> String {
  subject
    .replace('*', "$x$")
    .chars()
    .map(|c| match c {
      '/' | '\\' | ':' | '?' | '"' | '<' | '>' | '|' => '_',
      c => c,
    })
    .collect()
}

async fn read_optional(path: PathBuf) -> Result<Option<String>> {
  match fs::read_to_string(&path).await {
    Ok(s) => Ok(Some(s)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

async fn write_file(path: PathBuf, content: &str) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).await?;
  }
  let mut file = fs::File::create(&path).await?;
  file.write_all(content.as_bytes()).await?;
  file.flush().await?;
  Ok(())
}

#[async_trait]
impl CertificateCache for DiskCertificateCache {
  async fn load_root(&self) -> Result<Option<String>> {
    read_optional(self.root_path()).await
  }
  async fn save_root(&self, pem: &str) -> Result<()> {
    write_file(self.root_path(), pem).await
  }
  async fn load_leaf(&self, subject: &str) -> Result<Option<String>> {
    read_optional(self.leaf_path(subject)).await
  }
  async fn save_leaf(&self, subject: &str, pem: &str) -> Result<()> {
    write_file(self.leaf_path(subject), pem).await
  }
  async fn clear(&self) -> Result<()> {
    match fs::remove_dir_all(self.root.join(LEAF_DIRECTORY)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}
