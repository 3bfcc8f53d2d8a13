//! Screenshot evidence capture

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

/// Writes screenshots for passes that need a human look later
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a PNG under `{target_id}-{reason}-{timestamp}.png` and return its
    /// path. Failures are logged and swallowed; evidence must never fail a
    /// pass.
    pub async fn save(&self, target_id: &str, reason: &str, png: &[u8]) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("Evidence directory unavailable: {}", e);
            return None;
        }
        let name = format!(
            "{}-{}-{}.png",
            sanitize(target_id),
            sanitize(reason),
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.dir.join(name);
        match tokio::fs::write(&path, png).await {
            Ok(()) => {
                debug!("Evidence saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Evidence write failed for {}: {}", target_id, e);
                None
            }
        }
    }
}

/// Keep file names portable regardless of what ends up in target ids
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize("t1/../x"), "t1____x");
        assert_eq!(sanitize("prefecture-75"), "prefecture-75");
    }

    #[tokio::test]
    async fn save_writes_a_named_png() {
        let dir = std::env::temp_dir().join(format!("evidence-test-{}", std::process::id()));
        let store = EvidenceStore::new(&dir);
        let path = store.save("t1", "slotsFound", b"\x89PNG fake").await.unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("t1-slotsFound-"));
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, b"\x89PNG fake");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
