//! Temporary on-disk SSH key material
//!
//! Remote operations need the host's private key as a file. The file lives
//! exactly as long as the [`TemporarySshKey`] value and is removed on drop,
//! whichever way the caller leaves its scope.

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tempfile::TempPath;
use tracing::{debug, warn};

use super::TransportError;

pub struct TemporarySshKey {
    path: Option<TempPath>,
}

impl TemporarySshKey {
    /// Decode a base64 private key and write it to a fresh `0600` file.
    pub fn write(address: &str, encoded: &str) -> Result<Self, TransportError> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let material = STANDARD
            .decode(compact)
            .map_err(|e| TransportError::Key(format!("key for {} is not base64: {}", address, e)))?;

        let mut file = tempfile::Builder::new()
            .prefix("key")
            .tempfile()
            .map_err(|e| TransportError::Key(format!("creating key file: {}", e)))?;
        file.write_all(&material)
            .and_then(|_| file.flush())
            .map_err(|e| TransportError::Key(format!("writing key file: {}", e)))?;

        let path = file.into_temp_path();
        debug!("Wrote key for {} to {}", address, path.display());
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> &Path {
        // `path` is only taken in drop
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for TemporarySshKey {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let shown = path.display().to_string();
            match path.close() {
                Ok(()) => debug!("Removed temporary key file {}", shown),
                Err(e) => warn!("Unable to remove temporary key file {}: {}", shown, e),
            }
        }
    }
}
