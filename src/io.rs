use std::path::{Path, PathBuf};

use anyhow::bail;
use sha2::{Digest, Sha256};
use tokio::fs::{create_dir_all, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::ident::StudentIdentifier;
use crate::models::Photo;

pub async fn prepare_io<P: AsRef<Path>>(root: P) -> anyhow::Result<()> {
    create_dir_all(root.as_ref().join("students")).await?;
    create_dir_all(root.as_ref().join("photos")).await?;
    Ok(())
}

pub async fn create_io_file<P: Into<PathBuf>>(path: P) -> anyhow::Result<File> {
    let pathbuf = path.into();
    if let Some(parent) = pathbuf.parent() {
        create_dir_all(parent).await?;
    }
    match OpenOptions::new().write(true).create_new(true).open(&pathbuf).await {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            bail!("File {} already exists!", pathbuf.display())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn write_io_file<P: Into<PathBuf>>(path: P, bytes: &[u8]) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(create_io_file(path).await?);
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_io_file<P: Into<PathBuf>>(path: P) -> anyhow::Result<Vec<u8>> {
    let buf = path.into();
    if !buf.exists() {
        bail!("Tried to read nonexistent file {}!", buf.display())
    }
    let mut bytes = Vec::new();
    BufReader::new(File::open(buf).await?)
        .read_to_end(&mut bytes)
        .await?;
    Ok(bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher: Sha256 = Digest::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Where a photo ended up after upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPhoto {
    pub url: String,
    pub sha256: String,
}

/// Photo files keyed by student id, served back under `base_url`.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    dir: PathBuf,
    base_url: String,
}

impl PhotoStore {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, base_url: S) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn upload(&self, id: &StudentIdentifier, photo: &Photo) -> anyhow::Result<StoredPhoto> {
        let file_name = format!("{}.{}", id, photo.extension());
        write_io_file(self.dir.join(&file_name), &photo.bytes).await?;
        Ok(StoredPhoto {
            url: format!("{}/{}", self.base_url, file_name),
            sha256: sha256_hex(&photo.bytes),
        })
    }

    /// Reads a stored photo back. `file_name` comes straight from a URL,
    /// so anything that could leave the photo directory is refused.
    pub async fn read(&self, file_name: &str) -> anyhow::Result<Vec<u8>> {
        if file_name.is_empty() || file_name.contains(&['/', '\\'][..]) || file_name.starts_with('.') {
            bail!("Invalid photo name `{}`", file_name)
        }
        read_io_file(self.dir.join(file_name)).await
    }
}
