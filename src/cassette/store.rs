//! Cassette file persistence

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, info};

use super::encoding;
use super::episode::Episode;
use super::{CASSETTE_EXTENSION, MAX_NAME_LEN};
use crate::{BetamaxError, Result};

/// Reads and writes cassette files under one directory
#[derive(Debug, Clone)]
pub struct CassetteStore {
    dir: PathBuf,
}

impl CassetteStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// File backing the named cassette
    ///
    /// # Errors
    ///
    /// Returns error if the name cannot be used as a file name
    pub fn cassette_file(&self, name: &str) -> Result<PathBuf> {
        validate_cassette_name(name)?;
        Ok(self.dir.join(format!("{name}.{CASSETTE_EXTENSION}")))
    }

    /// Overwrite the cassette file with the full episode list
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub async fn save(&self, name: &str, episodes: &[Episode]) -> Result<()> {
        let path = self.cassette_file(name)?;
        let data = encoding::encode(episodes)
            .map_err(|e| BetamaxError::Other(format!("Failed to encode cassette: {e}")))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, data).await?;

        debug!("Saved {} episodes to {}", episodes.len(), path.display());
        Ok(())
    }

    /// Read the named cassette
    ///
    /// An empty name or a missing file is a fresh cassette with no episodes.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or decoded
    pub async fn load(&self, name: &str) -> Result<Vec<Episode>> {
        if name.is_empty() {
            return Ok(Vec::new());
        }

        let path = self.cassette_file(name)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No file for cassette '{}', starting fresh", name);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        encoding::decode(&data).map_err(|reason| BetamaxError::InvalidCassette {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Delete the named cassette's file, if any
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed
    pub async fn erase(&self, name: &str) -> Result<()> {
        let path = self.cassette_file(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Cassette '{}' erased", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate a cassette name
///
/// # Errors
///
/// Returns error if name is empty or could escape the cassette directory
pub fn validate_cassette_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BetamaxError::InvalidCassetteName(
            "Cassette name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(BetamaxError::InvalidCassetteName(format!(
            "Cassette name too long: {} > {MAX_NAME_LEN}",
            name.len()
        )));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(BetamaxError::InvalidCassetteName(
            "Cassette name cannot contain path separators".to_string(),
        ));
    }

    if name.starts_with('.') {
        return Err(BetamaxError::InvalidCassetteName(
            "Cassette name cannot start with dot".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(BetamaxError::InvalidCassetteName(
            "Cassette name cannot contain null bytes".to_string(),
        ));
    }

    if name.contains("..") {
        return Err(BetamaxError::InvalidCassetteName(
            "Cassette name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}
