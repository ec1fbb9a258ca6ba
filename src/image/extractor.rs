//! Parses a layered container image archive (the format `docker save`
//! produces: an outer tar containing `manifest.json`, one image
//! configuration document, and one tar per layer) and materializes the
//! layers into a single root filesystem, honoring overlay whiteout
//! semantics along the way.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use oci_spec::image::ImageConfiguration;
use serde::Deserialize;

use crate::error::{Error, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

pub struct MaterializeOutcome {
    pub launch_command: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Guarantees the scratch directory is removed on every exit path,
/// including early returns via `?`.
struct ScratchDir {
    path: PathBuf,
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
            }
        }
    }
}

/// Streams `reader` into a scratch directory, applies every layer in
/// manifest order onto `destination_root/rootfs`, and returns the image's
/// default launch command.
///
/// `destination_root` must not already contain a `rootfs` directory; a
/// pre-existing one is reported as `Error::AlreadyExists` rather than
/// silently overwritten.
pub fn materialize<R: Read>(reader: R, destination_root: &Path) -> Result<MaterializeOutcome> {
    let rootfs = destination_root.join("rootfs");
    if rootfs.exists() {
        return Err(Error::AlreadyExists(format!(
            "rootfs already materialized at {}",
            rootfs.display()
        )));
    }

    let scratch_root = destination_root
        .parent()
        .unwrap_or(destination_root)
        .join(format!(".scratch-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&scratch_root)
        .map_err(|e| Error::Extraction(format!("creating scratch dir: {e}")))?;
    let scratch = ScratchDir { path: scratch_root.clone() };

    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(&scratch.path)
        .map_err(|e| Error::Extraction(format!("unpacking image archive: {e}")))?;

    let manifest_path = scratch.path.join("manifest.json");
    let manifest_raw = fs::read_to_string(&manifest_path)
        .map_err(|e| Error::Extraction(format!("missing manifest.json: {e}")))?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&manifest_raw)
        .map_err(|e| Error::Extraction(format!("parsing manifest.json: {e}")))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| Error::Extraction("manifest.json has no entries".to_owned()))?;

    let config_path = scratch.path.join(&entry.config);
    let config_file = fs::File::open(&config_path)
        .map_err(|e| Error::Extraction(format!("missing image config {}: {e}", entry.config)))?;
    let image_config = ImageConfiguration::from_reader(config_file)
        .map_err(|e| Error::Extraction(format!("parsing image config: {e}")))?;

    let launch_command = launch_command_from_config(&image_config)?;

    fs::create_dir_all(&rootfs)
        .map_err(|e| Error::Extraction(format!("creating rootfs dir: {e}")))?;
    for layer_name in &entry.layers {
        let layer_path = scratch.path.join(layer_name);
        apply_layer(&layer_path, &rootfs)?;
    }

    Ok(MaterializeOutcome { launch_command })
}

fn launch_command_from_config(config: &ImageConfiguration) -> Result<Vec<String>> {
    let cfg = config
        .config()
        .as_ref()
        .ok_or_else(|| Error::Extraction("image config has no runtime config section".to_owned()))?;
    let mut command: Vec<String> = cfg.entrypoint().clone().unwrap_or_default();
    command.extend(cfg.cmd().clone().unwrap_or_default());
    if command.is_empty() {
        return Err(Error::Extraction(
            "image config has empty entrypoint and cmd".to_owned(),
        ));
    }
    Ok(command)
}

fn open_layer_reader(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::Extraction(format!("missing layer blob {}: {e}", path.display())))?;
    let mut magic = [0u8; 2];
    let n = file
        .read(&mut magic)
        .map_err(|e| Error::Extraction(format!("reading layer blob {}: {e}", path.display())))?;
    let rewound = std::io::Cursor::new(magic[..n].to_vec()).chain(file);
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(rewound)))
    } else {
        Ok(Box::new(rewound))
    }
}

fn apply_layer(layer_path: &Path, rootfs: &Path) -> Result<()> {
    let reader = open_layer_reader(layer_path)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::Extraction(format!("reading layer {}: {e}", layer_path.display())))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::Extraction(format!("reading layer entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::Extraction(format!("reading entry path: {e}")))?
            .into_owned();

        if entry_path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            return Err(Error::Extraction(format!(
                "layer entry escapes rootfs: {}",
                entry_path.display()
            )));
        }

        let file_name = match entry_path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };

        if file_name == WHITEOUT_OPAQUE {
            let dir = entry_path
                .parent()
                .map(|p| rootfs.join(p))
                .unwrap_or_else(|| rootfs.to_path_buf());
            clear_directory_contents(&dir)?;
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = entry_path.parent().unwrap_or(Path::new(""));
            let target = rootfs.join(parent).join(target_name);
            remove_path(&target)?;
            continue;
        }

        let destination = rootfs.join(&entry_path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Extraction(format!("creating {}: {e}", parent.display())))?;
        }

        let is_dir = entry.header().entry_type().is_dir();
        if !is_dir {
            remove_path(&destination)?;
        }
        entry
            .unpack(&destination)
            .map_err(|e| Error::Extraction(format!("extracting {}: {e}", destination.display())))?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .map_err(|e| Error::Extraction(format!("removing {}: {e}", path.display()))),
        Ok(_) => fs::remove_file(path)
            .map_err(|e| Error::Extraction(format!("removing {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Extraction(format!(
            "stat {} before removal: {e}",
            path.display()
        ))),
    }
}

fn clear_directory_contents(dir: &Path) -> Result<()> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            for child in entries {
                let child = child
                    .map_err(|e| Error::Extraction(format!("reading {}: {e}", dir.display())))?;
                remove_path(&child.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Extraction(format!(
            "reading directory {} for opaque whiteout: {e}",
            dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_with_entries(entries: &[(&str, &[u8], bool)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents, is_dir) in entries {
            if *is_dir {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            } else {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append(&header, *contents).unwrap();
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn regular_whiteout_deletes_underlying_file() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("keep.txt"), b"keep").unwrap();
        fs::write(rootfs.join("gone.txt"), b"gone").unwrap();

        let layer = tar_with_entries(&[(".wh.gone.txt", &[], false)]);
        let layer_path = dir.path().join("layer.tar");
        fs::write(&layer_path, &layer).unwrap();

        apply_layer(&layer_path, &rootfs).unwrap();

        assert!(rootfs.join("keep.txt").exists());
        assert!(!rootfs.join("gone.txt").exists());
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("data")).unwrap();
        fs::write(rootfs.join("data/a.txt"), b"a").unwrap();
        fs::write(rootfs.join("data/b.txt"), b"b").unwrap();

        let layer = tar_with_entries(&[("data/.wh..wh..opq", &[], false)]);
        let layer_path = dir.path().join("layer.tar");
        fs::write(&layer_path, &layer).unwrap();

        apply_layer(&layer_path, &rootfs).unwrap();

        assert!(rootfs.join("data").exists());
        assert!(!rootfs.join("data/a.txt").exists());
        assert!(!rootfs.join("data/b.txt").exists());
    }

    #[test]
    fn later_layer_overwrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("app.conf"), b"old").unwrap();

        let layer = tar_with_entries(&[("app.conf", b"new", false)]);
        let layer_path = dir.path().join("layer.tar");
        fs::write(&layer_path, &layer).unwrap();

        apply_layer(&layer_path, &rootfs).unwrap();

        assert_eq!(fs::read(rootfs.join("app.conf")).unwrap(), b"new");
    }

    #[test]
    fn rejects_absolute_path_entry() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let layer = tar_with_entries(&[("/etc/cron.d/evil", b"bad", false)]);
        let layer_path = dir.path().join("layer.tar");
        fs::write(&layer_path, &layer).unwrap();

        let err = apply_layer(&layer_path, &rootfs).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert!(!Path::new("/etc/cron.d/evil").exists());
    }

    #[test]
    fn rejects_already_materialized_destination() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("rootfs")).unwrap();
        let outer = Vec::new();
        let err = materialize(std::io::Cursor::new(outer), dir.path()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }
}
