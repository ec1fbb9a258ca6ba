//! Deployment registry: the single owner of published deployments.
//!
//! Follows the same "persist-first" discipline `boxlite`'s `BoxManager` uses
//! for its SQLite-backed store: every mutation is written to the on-disk
//! registry file before the in-memory cache is updated, so a crash between
//! the two never leaves the cache ahead of disk.

mod pool;
mod store;

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;

pub use store::Deployment;
use store::{RegistryFile, Store};

use crate::error::{Error, Result};
use crate::image;
use pool::AddressPool;

/// Outcome of loading the registry at startup: the live deployments plus
/// the names whose rootfs could not be validated (and so are excluded from
/// re-binding, though their record is left untouched in the registry file).
pub struct LoadOutcome {
    pub registry: Registry,
    pub invalid: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Registry {
    inner: std::sync::Arc<parking_lot::RwLock<Inner>>,
}

struct Inner {
    deployments: HashMap<String, Deployment>,
    store: Store,
    pool: AddressPool,
    root_dir: PathBuf,
    container_port: u16,
}

impl Registry {
    /// Loads the registry file under `root_dir`, validates that every
    /// record's rootfs still exists, and returns the set of records usable
    /// for listener re-binding.
    pub fn load(root_dir: PathBuf, address_pool_cidr: &str, container_port: u16) -> Result<LoadOutcome> {
        let store = Store::new(root_dir.join("registry.json"));
        let file = store.load()?;
        let pool = AddressPool::parse(address_pool_cidr)?;

        let mut deployments = HashMap::new();
        let mut invalid = Vec::new();
        for (name, record) in file.deployments {
            if record.rootfs.exists() {
                deployments.insert(name, record);
            } else {
                tracing::error!(
                    deployment = %name,
                    rootfs = %record.rootfs.display(),
                    "deployment rootfs missing at startup; excluding from listener rebind"
                );
                invalid.push((name, format!("rootfs missing: {}", record.rootfs.display())));
            }
        }

        let registry = Registry {
            inner: std::sync::Arc::new(parking_lot::RwLock::new(Inner {
                deployments,
                store,
                pool,
                root_dir,
                container_port,
            })),
        };
        Ok(LoadOutcome { registry, invalid })
    }

    /// Publishes a new deployment: materializes the rootfs, allocates an
    /// address, and persists the record before returning it. Any failure
    /// rolls back the partially-materialized rootfs.
    pub fn publish<R: Read>(&self, name: &str, archive: R) -> Result<Deployment> {
        validate_name(name)?;

        let (root_dir, container_port) = {
            let inner = self.inner.read();
            if inner.deployments.contains_key(name) {
                return Err(Error::AlreadyExists(name.to_owned()));
            }
            (inner.root_dir.clone(), inner.container_port)
        };

        let deployment_root = root_dir.join("images").join(name);
        let outcome = match image::materialize(archive, &deployment_root) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&deployment_root);
                return Err(e);
            }
        };

        let mut inner = self.inner.write();
        if inner.deployments.contains_key(name) {
            let _ = std::fs::remove_dir_all(&deployment_root);
            return Err(Error::AlreadyExists(name.to_owned()));
        }

        // Recomputed under the write lock, immediately before allocation, so
        // two concurrent publishes can never be handed the same address:
        // the snapshot taken before the (slow, I/O-bound) `materialize` call
        // above is stale by the time we're ready to allocate.
        let used: HashSet<_> = inner.deployments.values().map(|d| d.address).collect();
        let address = match inner.pool.allocate(&used) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&deployment_root);
                return Err(e);
            }
        };

        let deployment = Deployment {
            name: name.to_owned(),
            address,
            port: container_port,
            rootfs: deployment_root.join("rootfs"),
            command: outcome.launch_command,
        };

        if let Err(e) = persist(&mut inner, &deployment) {
            let _ = std::fs::remove_dir_all(&deployment_root);
            return Err(e);
        }

        inner.deployments.insert(name.to_owned(), deployment.clone());
        tracing::info!(deployment = %name, address = %deployment.address, "published deployment");
        Ok(deployment)
    }

    /// Rolls back a deployment that failed to come up after the registry
    /// record was persisted (e.g. address binding or listener setup
    /// failed). Not exposed over the Control API; the spec deliberately
    /// has no delete endpoint.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.deployments.remove(name).is_none() {
            return Ok(());
        }
        let file = RegistryFile {
            version: 1,
            deployments: inner
                .deployments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        inner.store.save(&file)
    }

    pub fn lookup(&self, name: &str) -> Result<Deployment> {
        self.inner
            .read()
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn list(&self) -> Vec<Deployment> {
        self.inner.read().deployments.values().cloned().collect()
    }
}

fn persist(inner: &mut Inner, new_record: &Deployment) -> Result<()> {
    let mut file = RegistryFile {
        version: 1,
        deployments: inner
            .deployments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    file.deployments
        .insert(new_record.name.clone(), new_record.clone());
    inner.store.save(&file)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("deployment name must not be empty".to_owned()));
    }
    if !name.is_ascii() {
        return Err(Error::InvalidInput(format!("deployment name {name} must be ASCII")));
    }
    if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) || name == "." || name == ".." {
        return Err(Error::InvalidInput(format!(
            "deployment name {name} must not contain path separators"
        )));
    }
    Ok(())
}
