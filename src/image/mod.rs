//! Image ingestion: turns a layered container image archive into a
//! materialized, immutable root filesystem plus the image's default launch
//! command.

mod extractor;

pub use extractor::{materialize, MaterializeOutcome};

/// Builds minimal valid image archives in memory, for use by this crate's
/// own tests (registry, control API) that need a `materialize`-able image
/// without shipping a fixture file.
#[cfg(test)]
pub mod tests_support {
    /// A single-layer image archive whose layer writes `/app/handler` and
    /// whose config sets `entrypoint = ["/app/handler"]`.
    pub fn single_layer_archive() -> Vec<u8> {
        build_archive(&[("app/handler", b"#!/bin/sh\necho ok\n")])
    }

    fn build_archive(layer_files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut layer_builder = tar::Builder::new(Vec::new());
        for (path, contents) in layer_files {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            layer_builder.append(&header, *contents).unwrap();
        }
        let layer_bytes = layer_builder.into_inner().unwrap();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Entrypoint": ["/app/handler"],
                "Cmd": [],
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": [],
            },
            "history": [],
        });
        let config_bytes = serde_json::to_vec_pretty(&config).unwrap();

        let manifest = serde_json::json!([
            {
                "Config": "config.json",
                "RepoTags": ["test:latest"],
                "Layers": ["layer.tar"],
            }
        ]);
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap();

        let mut outer = tar::Builder::new(Vec::new());
        append_file(&mut outer, "manifest.json", &manifest_bytes);
        append_file(&mut outer, "config.json", &config_bytes);
        append_file(&mut outer, "layer.tar", &layer_bytes);
        outer.into_inner().unwrap()
    }

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, contents).unwrap();
    }
}
