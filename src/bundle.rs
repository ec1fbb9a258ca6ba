//! Builds an OCI runtime bundle (a `config.json` document plus a reference
//! to the shared, already-materialized rootfs) for exactly one in-flight
//! request. The bundle directory is self-contained: removing it leaves no
//! residue, since the rootfs it points at is only referenced, never copied.

use std::path::{Path, PathBuf};

use oci_spec::runtime::{
    LinuxBuilder, LinuxCpuBuilder, LinuxMemoryBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, LinuxResourcesBuilder, Mount, MountBuilder, ProcessBuilder, RootBuilder,
    SpecBuilder,
};

use crate::error::{Error, Result};

const CONTROL_SOCKET_PATH: &str = "/control.sock";
const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Writes `bundle_dir/config.json` referencing `rootfs` (read-only, shared)
/// and bind-mounting `rendezvous_path` read-only at `/control.sock`.
pub fn build(
    bundle_dir: &Path,
    rootfs: &Path,
    command: &[String],
    rendezvous_path: &Path,
    memory_mib: u64,
    cpu_quota_us: i64,
    cpu_period_us: u64,
) -> Result<()> {
    std::fs::create_dir_all(bundle_dir)
        .map_err(|e| Error::Internal(format!("creating bundle dir: {e}")))?;

    let mut root = RootBuilder::default()
        .build()
        .map_err(|e| Error::Internal(format!("building root: {e}")))?;
    root.set_path(rootfs.to_path_buf());
    root.set_readonly(Some(true));

    let mut process = ProcessBuilder::default()
        .build()
        .map_err(|e| Error::Internal(format!("building process: {e}")))?;
    process.set_terminal(Some(false));
    process.set_args(Some(command.to_vec()));
    process.set_env(Some(vec![DEFAULT_PATH_ENV.to_owned()]));
    process.set_cwd(PathBuf::from("/"));
    process.set_no_new_privileges(Some(true));

    let mounts = build_mounts(rendezvous_path)
        .map_err(|e| Error::Internal(format!("building mounts: {e}")))?;

    let namespaces = build_namespaces()
        .map_err(|e| Error::Internal(format!("building namespaces: {e}")))?;

    let resources = LinuxResourcesBuilder::default()
        .memory(
            LinuxMemoryBuilder::default()
                .limit((memory_mib * 1024 * 1024) as i64)
                .build()
                .map_err(|e| Error::Internal(format!("building memory limits: {e}")))?,
        )
        .cpu(
            LinuxCpuBuilder::default()
                .quota(cpu_quota_us)
                .period(cpu_period_us)
                .build()
                .map_err(|e| Error::Internal(format!("building cpu limits: {e}")))?,
        )
        .build()
        .map_err(|e| Error::Internal(format!("building resources: {e}")))?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .resources(resources)
        .masked_paths(masked_paths())
        .readonly_paths(readonly_paths())
        .build()
        .map_err(|e| Error::Internal(format!("building linux config: {e}")))?;

    let spec = SpecBuilder::default()
        .version("1.0.2".to_owned())
        .root(root)
        .process(process)
        .mounts(mounts)
        .linux(linux)
        .build()
        .map_err(|e| Error::Internal(format!("building spec: {e}")))?;

    spec.save(bundle_dir.join("config.json"))
        .map_err(|e| Error::Internal(format!("writing config.json: {e}")))?;
    Ok(())
}

fn build_mounts(rendezvous_path: &Path) -> std::result::Result<Vec<Mount>, oci_spec::OciSpecError> {
    let mut mounts = Vec::new();

    mounts.push(
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec![
                "nosuid".to_owned(),
                "strictatime".to_owned(),
                "mode=0755".to_owned(),
                "size=4096k".to_owned(),
            ])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .options(vec![
                "nosuid".to_owned(),
                "noexec".to_owned(),
                "newinstance".to_owned(),
                "ptmxmode=0666".to_owned(),
                "mode=0620".to_owned(),
            ])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/dev/shm")
            .typ("tmpfs")
            .source("shm")
            .options(vec![
                "nosuid".to_owned(),
                "noexec".to_owned(),
                "nodev".to_owned(),
                "mode=1777".to_owned(),
                "size=65536k".to_owned(),
            ])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue")
            .source("mqueue")
            .options(vec!["nosuid".to_owned(), "noexec".to_owned(), "nodev".to_owned()])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/sys")
            .typ("sysfs")
            .source("sysfs")
            .options(vec![
                "nosuid".to_owned(),
                "noexec".to_owned(),
                "nodev".to_owned(),
                "ro".to_owned(),
            ])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/sys/fs/cgroup")
            .typ("cgroup")
            .source("cgroup")
            .options(vec![
                "nosuid".to_owned(),
                "noexec".to_owned(),
                "nodev".to_owned(),
                "relatime".to_owned(),
                "ro".to_owned(),
            ])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination("/tmp")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec!["nosuid".to_owned(), "nodev".to_owned(), "mode=1777".to_owned()])
            .build()?,
    );
    mounts.push(
        MountBuilder::default()
            .destination(CONTROL_SOCKET_PATH)
            .typ("none")
            .source(rendezvous_path.to_path_buf())
            .options(vec!["bind".to_owned(), "ro".to_owned()])
            .build()?,
    );

    Ok(mounts)
}

fn build_namespaces() -> std::result::Result<Vec<LinuxNamespace>, oci_spec::OciSpecError> {
    [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Network,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
    ]
    .into_iter()
    .map(|typ| LinuxNamespaceBuilder::default().typ(typ).build())
    .collect()
}

fn masked_paths() -> Vec<String> {
    [
        "/proc/kcore",
        "/proc/keys",
        "/proc/latency_stats",
        "/proc/timer_list",
        "/proc/timer_stats",
        "/proc/sched_debug",
        "/sys/firmware",
        "/proc/scsi",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn readonly_paths() -> Vec<String> {
    [
        "/proc/asound",
        "/proc/bus",
        "/proc/fs",
        "/proc/irq",
        "/proc/sys",
        "/proc/sysrq-trigger",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_self_contained_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_dir = dir.path().join("bundle");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let rendezvous = dir.path().join("rendezvous.sock");

        build(
            &bundle_dir,
            &rootfs,
            &["/app/handler".to_owned()],
            &rendezvous,
            512,
            100_000,
            100_000,
        )
        .unwrap();

        let config_path = bundle_dir.join("config.json");
        assert!(config_path.exists());
        let raw = std::fs::read_to_string(&config_path).unwrap();
        assert!(raw.contains("/app/handler"));
        assert!(raw.contains("/control.sock"));

        std::fs::remove_dir_all(&bundle_dir).unwrap();
        assert!(rootfs.exists(), "removing the bundle must not touch the shared rootfs");
    }
}
