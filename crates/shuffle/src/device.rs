//! Device health monitoring and mount isolation.
//!
//! Each registered mount is probed periodically: a small file is created,
//! written, fsynced, read back, and deleted. A failing or slow mount moves to
//! the isolated set and its observers are told to abort in-flight writers.
//! Flushers report errors here directly so isolation does not wait for the
//! next probe tick.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

const PROBE_FILE: &str = ".rss-device-probe";
const PROBE_PAYLOAD: &[u8] = b"rss-device-probe";

/// Why a mount was isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Probe or flush hit an IO error.
    ReadWriteFailure,
    /// The filesystem reported no space.
    InsufficientDiskSpace,
    /// A flush exceeded the slow-flush threshold.
    FlushTimeout,
}

/// Reacts to mount health transitions.
pub trait DeviceObserver: Send + Sync {
    /// The mount failed: abort in-flight writers, fail their notifiers.
    fn on_error(&self, mount: &Path, kind: DeviceErrorKind);

    /// The mount passed a probe after being isolated; new writers may choose
    /// it again.
    fn on_healthy(&self, _mount: &Path) {}

    /// Soft isolation: no new writers, existing writers continue.
    fn on_high_disk_usage(&self, _mount: &Path) {}
}

#[derive(Debug, Default)]
struct MountHealth {
    isolated: Option<DeviceErrorKind>,
    soft_isolated: bool,
}

/// Periodic prober and isolation registry for shuffle mounts.
pub struct DeviceMonitor {
    mounts: Mutex<HashMap<PathBuf, MountHealth>>,
    observers: Mutex<Vec<Arc<dyn DeviceObserver>>>,
    probe_interval: Duration,
}

impl DeviceMonitor {
    /// Build a monitor over the given mounts.
    pub fn new(mounts: &[PathBuf], probe_interval: Duration) -> Arc<Self> {
        let map = mounts
            .iter()
            .map(|m| (m.clone(), MountHealth::default()))
            .collect();
        Arc::new(Self {
            mounts: Mutex::new(map),
            observers: Mutex::new(Vec::new()),
            probe_interval,
        })
    }

    /// Subscribe to health transitions.
    pub fn register_observer(&self, observer: Arc<dyn DeviceObserver>) {
        self.observers.lock().expect("observer lock").push(observer);
    }

    /// Whether a mount is currently hard-isolated.
    pub fn is_isolated(&self, mount: &Path) -> bool {
        self.mounts
            .lock()
            .expect("mount lock")
            .get(mount)
            .map(|h| h.isolated.is_some())
            .unwrap_or(true)
    }

    /// Whether new writers may be placed on the mount.
    pub fn accepts_new_writers(&self, mount: &Path) -> bool {
        self.mounts
            .lock()
            .expect("mount lock")
            .get(mount)
            .map(|h| h.isolated.is_none() && !h.soft_isolated)
            .unwrap_or(false)
    }

    /// Number of hard-isolated mounts.
    pub fn isolated_count(&self) -> usize {
        self.mounts
            .lock()
            .expect("mount lock")
            .values()
            .filter(|h| h.isolated.is_some())
            .count()
    }

    /// Report an error observed outside the probe cycle (flusher IO error or
    /// slow-flush quarantine). Safe to call from flusher threads.
    pub fn report_error(&self, mount: &Path, kind: DeviceErrorKind) {
        {
            let mut mounts = self.mounts.lock().expect("mount lock");
            let health = mounts.entry(mount.to_path_buf()).or_default();
            if health.isolated.is_some() {
                return;
            }
            health.isolated = Some(kind);
        }
        warn!(mount = %mount.display(), ?kind, "isolating mount");
        for observer in self.observers.lock().expect("observer lock").iter() {
            observer.on_error(mount, kind);
        }
    }

    /// Soft-isolate a mount: keep existing writers, place no new ones.
    pub fn report_high_disk_usage(&self, mount: &Path) {
        {
            let mut mounts = self.mounts.lock().expect("mount lock");
            let health = mounts.entry(mount.to_path_buf()).or_default();
            if health.soft_isolated {
                return;
            }
            health.soft_isolated = true;
        }
        warn!(mount = %mount.display(), "soft-isolating mount on high disk usage");
        for observer in self.observers.lock().expect("observer lock").iter() {
            observer.on_high_disk_usage(mount);
        }
    }

    fn mark_healthy(&self, mount: &Path) {
        let was_isolated = {
            let mut mounts = self.mounts.lock().expect("mount lock");
            let health = mounts.entry(mount.to_path_buf()).or_default();
            let was = health.isolated.is_some() || health.soft_isolated;
            health.isolated = None;
            health.soft_isolated = false;
            was
        };
        if was_isolated {
            info!(mount = %mount.display(), "re-admitting mount");
            for observer in self.observers.lock().expect("observer lock").iter() {
                observer.on_healthy(mount);
            }
        }
    }

    /// Run one probe pass over every registered mount. Blocking IO; callers
    /// in async context wrap this in `spawn_blocking`.
    pub fn probe_once(&self) {
        let mounts: Vec<PathBuf> = self
            .mounts
            .lock()
            .expect("mount lock")
            .keys()
            .cloned()
            .collect();
        for mount in mounts {
            match probe_mount(&mount) {
                Ok(()) => self.mark_healthy(&mount),
                Err(e) => {
                    let kind = if e.kind() == ErrorKind::StorageFull {
                        DeviceErrorKind::InsufficientDiskSpace
                    } else {
                        DeviceErrorKind::ReadWriteFailure
                    };
                    self.report_error(&mount, kind);
                }
            }
        }
    }

    /// Spawn the periodic probe loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = monitor.probe_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let m = Arc::clone(&monitor);
                let _ = tokio::task::spawn_blocking(move || m.probe_once()).await;
            }
        })
    }
}

fn probe_mount(mount: &Path) -> std::io::Result<()> {
    fs::create_dir_all(mount)?;
    let probe_path = mount.join(PROBE_FILE);
    {
        let mut file = fs::File::create(&probe_path)?;
        file.write_all(PROBE_PAYLOAD)?;
        file.sync_all()?;
    }
    let mut readback = Vec::with_capacity(PROBE_PAYLOAD.len());
    fs::File::open(&probe_path)?.read_to_end(&mut readback)?;
    fs::remove_file(&probe_path)?;
    if readback != PROBE_PAYLOAD {
        return Err(std::io::Error::other("probe read back mismatched bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        errors: AtomicUsize,
        healthy: AtomicUsize,
        soft: AtomicUsize,
    }

    impl CountingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                errors: AtomicUsize::new(0),
                healthy: AtomicUsize::new(0),
                soft: AtomicUsize::new(0),
            })
        }
    }

    impl DeviceObserver for CountingObserver {
        fn on_error(&self, _mount: &Path, _kind: DeviceErrorKind) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_healthy(&self, _mount: &Path) {
            self.healthy.fetch_add(1, Ordering::SeqCst);
        }
        fn on_high_disk_usage(&self, _mount: &Path) {
            self.soft.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn probe_passes_on_writable_mount() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DeviceMonitor::new(&[dir.path().to_path_buf()], Duration::from_secs(60));
        monitor.probe_once();
        assert!(!monitor.is_isolated(dir.path()));
        assert!(monitor.accepts_new_writers(dir.path()));
    }

    #[test]
    fn reported_error_isolates_until_probe_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DeviceMonitor::new(&[dir.path().to_path_buf()], Duration::from_secs(60));
        let observer = CountingObserver::new();
        monitor.register_observer(observer.clone());

        monitor.report_error(dir.path(), DeviceErrorKind::FlushTimeout);
        assert!(monitor.is_isolated(dir.path()));
        assert_eq!(monitor.isolated_count(), 1);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);

        // Duplicate reports do not re-notify.
        monitor.report_error(dir.path(), DeviceErrorKind::ReadWriteFailure);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);

        // The mount is actually healthy, so one probe re-admits it.
        monitor.probe_once();
        assert!(!monitor.is_isolated(dir.path()));
        assert_eq!(observer.healthy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn high_disk_usage_blocks_new_writers_only() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DeviceMonitor::new(&[dir.path().to_path_buf()], Duration::from_secs(60));
        let observer = CountingObserver::new();
        monitor.register_observer(observer.clone());

        monitor.report_high_disk_usage(dir.path());
        assert!(!monitor.is_isolated(dir.path()));
        assert!(!monitor.accepts_new_writers(dir.path()));
        assert_eq!(observer.soft.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_mount_is_treated_as_isolated() {
        let monitor = DeviceMonitor::new(&[], Duration::from_secs(60));
        assert!(monitor.is_isolated(Path::new("/nonexistent")));
    }
}
