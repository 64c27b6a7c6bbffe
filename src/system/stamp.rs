//! Checksum stamps for applied manifests and chart values.
//!
//! The cluster does not remember what content a manifest or release was last
//! applied with, so the checksum is recorded under the state directory after
//! every successful apply.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ActionError, ProbeError};

/// What a stamp records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampKind {
    /// Manifest content.
    Manifest,
    /// Chart values.
    Release,
}

/// Stamp files under `<state_dir>/stamps`.
#[derive(Debug, Clone)]
pub struct StampStore {
    root: PathBuf,
}

impl StampKind {
    const fn dir(self) -> &'static str {
        match self {
            Self::Manifest => "manifests",
            Self::Release => "releases",
        }
    }
}

impl StampStore {
    /// Creates a store rooted in a state directory.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("stamps"),
        }
    }

    /// Path of one stamp.
    #[must_use]
    pub fn path(&self, kind: StampKind, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(kind.dir()).join(format!("{file}.sha256"))
    }

    /// Reads a stamp; `None` if never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the stamp exists but cannot be read.
    pub async fn read(&self, kind: StampKind, name: &str) -> Result<Option<String>, ProbeError> {
        let path = self.path(kind, name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProbeError::Io {
                path,
                message: e.to_string(),
            }),
        }
    }

    /// Writes a stamp atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the stamp cannot be written.
    pub async fn write(&self, kind: StampKind, name: &str, sha256: &str) -> Result<(), ActionError> {
        let path = self.path(kind, name);
        debug!("Writing stamp: {}", path.display());
        super::write_atomic(&path, format!("{sha256}\n").as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_stamp_reads_none() {
        let dir = TempDir::new().unwrap();
        let stamps = StampStore::new(dir.path());

        let stamp = stamps.read(StampKind::Manifest, "traefik-config").await.unwrap();

        assert!(stamp.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let stamps = StampStore::new(dir.path());

        stamps
            .write(StampKind::Release, "monitoring/grafana", "abc123")
            .await
            .unwrap();

        let stamp = stamps.read(StampKind::Release, "monitoring/grafana").await.unwrap();
        assert_eq!(stamp.as_deref(), Some("abc123"));
        assert!(
            stamps
                .path(StampKind::Release, "monitoring/grafana")
                .ends_with("stamps/releases/monitoring_grafana.sha256")
        );
    }
}
