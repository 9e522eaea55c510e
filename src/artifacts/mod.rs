use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::ModelDescriptor;

/// Hex SHA-256 of artifact bytes
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A parsed descriptor and the digest of the exact bytes it was parsed from
#[derive(Debug, Clone)]
pub struct Artifact {
    pub descriptor: ModelDescriptor,
    pub digest: String,
}

/// Result of reading a descriptor file
#[derive(Debug, Clone)]
pub enum ArtifactRead {
    Absent,
    /// File exists but could not be read or parsed
    Malformed(String),
    Present(Artifact),
}

impl ArtifactRead {
    pub fn descriptor(&self) -> Option<&ModelDescriptor> {
        match self {
            ArtifactRead::Present(a) => Some(&a.descriptor),
            ArtifactRead::Absent | ArtifactRead::Malformed(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&str> {
        match self {
            ArtifactRead::Present(a) => Some(&a.digest),
            ArtifactRead::Absent | ArtifactRead::Malformed(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ArtifactRead::Absent => "absent".to_string(),
            ArtifactRead::Malformed(reason) => format!("malformed ({})", reason),
            ArtifactRead::Present(a) => format!("{} sha256={}", a.descriptor.summary(), &a.digest[..12]),
        }
    }
}

/// Reads model descriptors relative to a base directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve a configured path against the base directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Absolute form of a configured path, for handing to child processes
    pub fn absolute(&self, path: impl AsRef<Path>) -> PathBuf {
        let resolved = self.resolve(path);
        if resolved.is_absolute() {
            return resolved;
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(resolved),
            Err(_) => resolved,
        }
    }

    /// Read a descriptor once. Never fails: problems are reported in the variant.
    pub fn read(&self, path: impl AsRef<Path>) -> ArtifactRead {
        let path = self.resolve(path);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No artifact at {}", path.display());
                return ArtifactRead::Absent;
            }
            Err(e) => {
                warn!("Failed to read artifact {}: {}", path.display(), e);
                return ArtifactRead::Malformed(e.to_string());
            }
        };

        match ModelDescriptor::from_slice(&bytes) {
            Ok(descriptor) => ArtifactRead::Present(Artifact {
                descriptor,
                digest: digest(&bytes),
            }),
            Err(e) => {
                warn!("Unparsable artifact {}: {}", path.display(), e);
                ArtifactRead::Malformed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
impl ArtifactStore {
    pub fn load(&self, path: impl AsRef<Path>) -> Option<ModelDescriptor> {
        self.read(path).descriptor().cloned()
    }

    pub fn write(&self, path: impl AsRef<Path>, descriptor: &ModelDescriptor) -> anyhow::Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, descriptor.to_json()?)?;
        Ok(())
    }
}
