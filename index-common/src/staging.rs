//! Staged image payloads.
//!
//! The submission service writes image bytes here and carries only the path
//! in the job record; a worker reads the payload back and unlinks it on any
//! terminal transition.

use std::path::{Path, PathBuf};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/gif" => Some(ImageFormat::Gif),
            "image/webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn from_extension(filename: &str) -> Option<Self> {
        let extension = Path::new(filename).extension()?.to_str()?;
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }
}

/// Decide whether a submitted payload is a supported image.
///
/// The payload's own magic bytes win; the declared content type is trusted
/// next, and the file extension only when no MIME type was sent. Empty
/// payloads are never images.
pub fn detect_format(
    content_type: Option<&str>,
    filename: Option<&str>,
    bytes: &[u8],
) -> Option<ImageFormat> {
    if bytes.is_empty() {
        return None;
    }
    ImageFormat::sniff(bytes)
        .or_else(|| content_type.and_then(ImageFormat::from_content_type))
        .or_else(|| filename.and_then(ImageFormat::from_extension))
}

/// Directory staged payloads are written under.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn stage(
        &self,
        job_id: &str,
        format: ImageFormat,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(format!("{job_id}.{}", format.extension()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

pub async fn read_staged(image_ref: &str) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(image_ref).await
}

/// Unlink a staged payload, ignoring failures: the TTL'd record is the
/// source of truth and a leaked file is harmless.
pub async fn remove_staged(image_ref: &str) {
    if let Err(err) = tokio::fs::remove_file(image_ref).await {
        debug!("failed to remove staged image {}: {}", image_ref, err);
    }
}
