//! Durable, human-readable, versioned persistence for the deployment
//! registry. Writes are always whole-file: serialize, write to a temporary
//! file in the same directory, then rename over the target so readers never
//! observe a partially written file.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub rootfs: PathBuf,
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u32,
    pub deployments: BTreeMap<String, Deployment>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            deployments: BTreeMap::new(),
        }
    }
}

pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<RegistryFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Internal(format!("parsing registry file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(Error::Internal(format!("reading registry file: {e}"))),
        }
    }

    pub fn save(&self, file: &RegistryFile) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Internal("registry path has no parent directory".to_owned()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Internal(format!("creating registry directory: {e}")))?;

        let raw = serde_json::to_vec_pretty(file)
            .map_err(|e| Error::Internal(format!("serializing registry file: {e}")))?;

        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, &raw)
            .map_err(|e| Error::Internal(format!("writing registry temp file: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Internal(format!("renaming registry file into place: {e}")))?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("registry.json");
    path.with_file_name(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()))
}
