//! `sysinfo`-backed resource monitor.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sysinfo::{Disks, System};
use tracing::debug;

use super::{ResourceMonitor, ResourceSample, percent_of};
use crate::error::MonitorError;

/// Samples the local host. Disk utilization is that of the filesystem
/// holding `disk_path` (normally the task database).
pub struct SysinfoMonitor {
    system: Arc<Mutex<System>>,
    disk_path: PathBuf,
}

impl SysinfoMonitor {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            disk_path: disk_path.into(),
        }
    }
}

#[async_trait]
impl ResourceMonitor for SysinfoMonitor {
    async fn sample(&self) -> Result<ResourceSample, MonitorError> {
        let system = Arc::clone(&self.system);
        let disk_path = self.disk_path.clone();

        tokio::task::spawn_blocking(move || sample_blocking(&system, &disk_path))
            .await
            .map_err(|e| MonitorError::SampleFailed(format!("sampler task panicked: {e}")))?
    }
}

fn sample_blocking(system: &Mutex<System>, disk_path: &Path) -> Result<ResourceSample, MonitorError> {
    let mut sys = system
        .lock()
        .map_err(|_| MonitorError::SampleFailed("system handle poisoned".into()))?;

    // CPU usage is a delta between two refreshes.
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    let cpu = f64::from(sys.global_cpu_usage());

    sys.refresh_memory();
    let ram = percent_of(sys.used_memory(), sys.total_memory());
    drop(sys);

    let disk = disk_percent(disk_path);
    debug!(cpu, ram, disk, "Resource sample");
    Ok(ResourceSample::new(cpu, ram, disk))
}

/// Utilization of the disk whose mount point is the longest prefix of `path`.
fn disk_percent(path: &Path) -> f64 {
    let target = resolve_existing(path);
    let disks = Disks::new_with_refreshed_list();
    let mounts = disks
        .list()
        .iter()
        .map(|d| (d.mount_point(), d.total_space(), d.available_space()));

    match best_mount(&target, mounts) {
        Some((total, available)) => percent_of(total.saturating_sub(available), total),
        None => {
            debug!(path = %target.display(), "No disk found for path");
            0.0
        }
    }
}

fn best_mount<'a>(
    target: &Path,
    mounts: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> Option<(u64, u64)> {
    mounts
        .filter(|(mount, _, _)| target.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, available)| (total, available))
}

/// Walk up to the nearest existing ancestor so a not-yet-created database
/// file still maps to its filesystem.
fn resolve_existing(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut current = absolute.as_path();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return canonical;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return absolute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_mount_prefix_wins() {
        let mounts = vec![
            (Path::new("/"), 100, 50),
            (Path::new("/data"), 200, 20),
            (Path::new("/data/other"), 300, 30),
        ];
        let picked = best_mount(Path::new("/data/tasks/db.sqlite"), mounts.into_iter());
        assert_eq!(picked, Some((200, 20)));
    }

    #[test]
    fn no_matching_mount() {
        let mounts = vec![(Path::new("/mnt"), 100, 50)];
        assert_eq!(best_mount(Path::new("/data/x"), mounts.into_iter()), None);
    }

    #[test]
    fn resolve_walks_to_existing_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("a").join("b").join("tasks.db");
        let resolved = resolve_existing(&missing);
        assert_eq!(resolved, tmp.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn live_sample_is_in_range() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = SysinfoMonitor::new(tmp.path().join("tasks.db"));
        let sample = monitor.sample().await.unwrap();
        for value in [sample.cpu_percent, sample.ram_percent, sample.disk_percent] {
            assert!((0.0..=100.0).contains(&value));
        }
    }
}
