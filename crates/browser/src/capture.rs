//! Screenshot artifacts on disk.
//!
//! Files are versioned and never overwritten: `<label>-<tag>-<seq>.png`, where
//! `tag` identifies the owning daemon and `seq` increases per capture. Each
//! file is written under a temporary name and renamed into place, so a path
//! handed back to a caller always points at a complete image.

use base64::Engine;
use browserlink_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const MAX_LABEL_LEN: usize = 64;

pub struct CaptureStore {
    dir: PathBuf,
    tag: String,
    seq: AtomicU64,
}

impl CaptureStore {
    pub fn new(dir: PathBuf, tag: &str) -> Self {
        Self {
            dir,
            tag: sanitize_label(tag),
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode a base64 PNG and store it under `label`.
    pub async fn store(&self, label: &str, png_base64: &str) -> Result<PathBuf> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(png_base64.trim())
            .map_err(|e| Error::Encoding(format!("screenshot is not valid base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(Error::Cdp("empty screenshot".to_string()));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{}-{}-{:04}.png", sanitize_label(label), self.tag, seq);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{}.tmp", name));

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %path.display(), bytes = bytes.len(), "Capture stored");
        Ok(path)
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect();
    if cleaned.is_empty() {
        "capture".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("home page/v2"), "home_page_v2");
        assert_eq!(sanitize_label("../../etc"), "______etc");
        assert_eq!(sanitize_label("   "), "capture");
        assert_eq!(sanitize_label(&"x".repeat(100)).len(), MAX_LABEL_LEN);
    }

    #[tokio::test]
    async fn test_store_versions_instead_of_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaptureStore::new(dir.path().join("shots"), "d1");

        let first = store.store("home", PNG_B64).await.unwrap();
        let second = store.store("home", PNG_B64).await.unwrap();
        assert_ne!(first, second);
        assert!(first.ends_with("home-d1-0001.png"));
        assert!(second.ends_with("home-d1-0002.png"));

        let bytes = std::fs::read(&second).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_bad_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaptureStore::new(dir.path().to_path_buf(), "d1");
        assert!(matches!(
            store.store("x", "%%%").await,
            Err(Error::Encoding(_))
        ));
        assert!(matches!(store.store("x", "").await, Err(Error::Cdp(_))));
    }
}
