use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::sniff::ImageKind;

/// On-disk blob storage for uploaded images.
///
/// Every blob is a flat file named `{uuid}.{ext}` directly under `dir`, and is
/// publicly reachable at `{base_url}/{name}`. Names are always generated
/// here; client-supplied filenames never reach the filesystem.
pub struct Storage {
    dir: PathBuf,
    base_url: String,
}

impl Storage {
    pub async fn new(dir: PathBuf, base_url: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Upload storage directory: {}", dir.display());
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { dir, base_url })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh random name carrying the verified extension.
    pub fn blob_name(kind: ImageKind) -> String {
        format!("{}.{}", Uuid::new_v4(), kind.extension())
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// The blob name behind one of our own URLs. Foreign URLs yield `None`.
    pub fn name_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        let name = url.strip_prefix(&self.base_url)?.strip_prefix('/')?;
        is_blob_name(name).then_some(name)
    }

    /// Write a blob and return its public URL.
    pub async fn put(&self, name: &str, data: &[u8]) -> Result<String> {
        if !is_blob_name(name) {
            bail!("Refusing to store blob under name '{}'", name);
        }
        fs::write(self.dir.join(name), data).await?;
        info!("Stored blob {} ({} bytes)", name, data.len());
        Ok(self.url_for(name))
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        if !is_blob_name(name) {
            bail!("Refusing to delete blob '{}'", name);
        }
        match fs::remove_file(self.dir.join(name)).await {
            Ok(()) => {
                info!("Deleted blob {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `{uuid}.{known ext}` and nothing else, which also rules out path
/// traversal.
fn is_blob_name(name: &str) -> bool {
    let Some((stem, ext)) = name.split_once('.') else {
        return false;
    };
    Uuid::parse_str(stem).is_ok() && ImageKind::from_extension(ext).is_some()
}
