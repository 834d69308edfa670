//! Hosts file store.
//!
//! Parses a hosts-formatted file into an immutable [`HostsSnapshot`] and
//! keeps it current with the file on disk.  Two reload policies exist:
//!
//! * **poll**: every lookup stats the file and reparses it when its
//!   modification time has moved forward.  [`HostsFile::batch_operation`]
//!   suspends the check for callers doing many lookups in a row.
//! * **watch**: a background task subscribes to filesystem notifications
//!   and reparses on writes.  Lookups never touch the disk.
//!
//! In both cases a new snapshot is installed with a single pointer swap, so
//! a reader sees either the old or the new file, never a mix.  A reload
//! that cannot read the file keeps the previous snapshot.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use log::{debug, error, info};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[cfg(windows)]
const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(windows))]
const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Time given to a writer to finish before the file is reparsed.
const SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("failed to read hosts file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the store notices changes to the backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicy {
    /// Compare modification times before every lookup.
    Poll,
    /// Reload on filesystem notifications.
    #[default]
    Watch,
}

/// One complete parse of a hosts file.
#[derive(Debug, Default)]
pub struct HostsSnapshot {
    entries: HashMap<String, Ipv4Addr>,
}

impl HostsSnapshot {
    /// Parse hosts-file syntax: `address name [alias...]`, `#` comments.
    ///
    /// Only IPv4 entries are kept.  IPv6 lines, and lines whose first field
    /// is not an address at all (scoped `fe80::1%lo0` entries, say), are
    /// skipped.  A name listed more than once resolves to its first
    /// occurrence.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let Ok(addr) = addr.parse::<IpAddr>() else {
                debug!("Skipping hosts line {}: {:?}", idx + 1, raw);
                continue;
            };
            let IpAddr::V4(addr) = addr else {
                continue;
            };
            for name in fields {
                entries.entry(name.to_ascii_lowercase()).or_insert(addr);
            }
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<Ipv4Addr> {
        let name = name.strip_suffix('.').unwrap_or(name);
        self.entries.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A hosts file kept in memory and refreshed according to a [`ReloadPolicy`].
pub struct HostsFile {
    path: PathBuf,
    policy: ReloadPolicy,
    snapshot: ArcSwap<HostsSnapshot>,
    last_modified: RwLock<SystemTime>,
    batch: AtomicBool,
}

impl HostsFile {
    /// Load the file at `path`, or the platform hosts file if `None`.
    ///
    /// Fails if the file cannot be read.
    pub fn open(path: Option<&Path>, policy: ReloadPolicy) -> Result<Self, HostsError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_PATH));
        let (snapshot, modified) = read_snapshot(&path)?;
        info!(
            "Loaded {} hosts entries from {} ({:?} reload)",
            snapshot.len(),
            path.display(),
            policy
        );

        Ok(Self {
            path,
            policy,
            snapshot: ArcSwap::from_pointee(snapshot),
            last_modified: RwLock::new(modified),
            batch: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Find the IPv4 address for `name` in the current snapshot.
    ///
    /// Under [`ReloadPolicy::Poll`] this stats the file, and reparses it when
    /// it changed, on the calling thread.  That is a blocking filesystem call
    /// inside whatever task resolves the query; use the watch policy, or
    /// [`batch_operation`](Self::batch_operation), where that matters.
    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        if self.policy == ReloadPolicy::Poll && !self.batch.load(Ordering::Acquire) {
            self.refresh_if_stale();
        }
        self.snapshot.load().get(name)
    }

    /// Suspend (`true`) or resume (`false`) the per-lookup staleness check
    /// of the poll policy.
    pub fn batch_operation(&self, started: bool) {
        self.batch.store(started, Ordering::Release);
    }

    /// The currently installed snapshot.
    pub fn snapshot(&self) -> Arc<HostsSnapshot> {
        self.snapshot.load_full()
    }

    /// Reparse the file and install the result.  On failure the previous
    /// snapshot stays in effect.
    pub fn reload(&self) -> Result<(), HostsError> {
        let (snapshot, modified) = read_snapshot(&self.path)?;
        let mut last = self
            .last_modified
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.install(snapshot);
        *last = modified;
        Ok(())
    }

    fn install(&self, snapshot: HostsSnapshot) {
        debug!(
            "Installing {} hosts entries from {}",
            snapshot.len(),
            self.path.display()
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    fn refresh_if_stale(&self) {
        let stale = {
            let last = self
                .last_modified
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match modified_time(&self.path) {
                Ok(modified) => modified > *last,
                Err(e) => {
                    error!("{}", e);
                    false
                }
            }
        };
        if !stale {
            return;
        }

        let mut last = self
            .last_modified
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another lookup may have reloaded while we waited for the lock.
        match modified_time(&self.path) {
            Ok(modified) if modified <= *last => return,
            Ok(_) => {}
            Err(e) => {
                error!("{}", e);
                return;
            }
        }
        match read_snapshot(&self.path) {
            Ok((snapshot, modified)) => {
                self.install(snapshot);
                *last = modified;
            }
            Err(e) => error!("Keeping previous hosts snapshot: {}", e),
        }
    }

    /// Start reloading on filesystem notifications.
    ///
    /// The returned handle stops the watch task.  If the watcher cannot be
    /// attached the failure is logged and the last snapshot keeps serving.
    pub fn watch(self: &Arc<Self>) -> HostsWatcher {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let hosts = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = hosts.watch_loop(shutdown_rx).await {
                error!(
                    "Hosts file watcher for {} stopped: {}",
                    hosts.path.display(),
                    e
                );
            }
        });

        HostsWatcher {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    async fn watch_loop(&self, mut shutdown: oneshot::Receiver<()>) -> notify::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Hosts file watch error: {}", e),
            },
            notify::Config::default(),
        )?;

        // Editors often replace the file, so watch its directory instead.
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for changes", self.path.display());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.is_write_to_file(&event) {
                        continue;
                    }
                    tokio::time::sleep(SETTLE_DELAY).await;
                    while rx.try_recv().is_ok() {}
                    match self.reload() {
                        Ok(()) => info!("Reloaded {}", self.path.display()),
                        Err(e) => error!("Keeping previous hosts snapshot: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn is_write_to_file(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }
}

/// Handle to a running hosts watch task.
pub struct HostsWatcher {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HostsWatcher {
    /// Stop watching and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, HostsError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| HostsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_snapshot(path: &Path) -> Result<(HostsSnapshot, SystemTime), HostsError> {
    // Stat before reading so a write racing the read is picked up next time.
    let modified = modified_time(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| HostsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((HostsSnapshot::parse(&content), modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::thread;
    use tempfile::TempDir;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn write_hosts(path: &Path, content: &str, bump_secs: u64) {
        std::fs::write(path, content).unwrap();
        // Force the mtime forward, filesystems with coarse timestamps would
        // otherwise hide back-to-back writes.
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(bump_secs))
            .unwrap();
    }

    #[test]
    fn parses_comments_aliases_and_ipv6() {
        let snapshot = HostsSnapshot::parse(
            "# Host Database\n\
             \n\
             127.0.0.1   localhost proxyhost   # loopback\n\
             ::1         localhost\n\
             192.168.2.111 influxdb registry.example.com\n\
             127.0.0.1   kubernetes.docker.internal\n\
             10.0.0.9    influxdb\n\
             10.0.0.10\n",
        );

        assert_eq!(snapshot.get("localhost"), Some(LOCALHOST));
        assert_eq!(snapshot.get("proxyhost"), Some(LOCALHOST));
        assert_eq!(
            snapshot.get("registry.example.com."),
            Some(Ipv4Addr::new(192, 168, 2, 111))
        );
        assert_eq!(
            snapshot.get("InfluxDB"),
            Some(Ipv4Addr::new(192, 168, 2, 111))
        );
        assert_eq!(snapshot.get("loopback"), None);
        assert_eq!(snapshot.len(), 5);
    }

    #[test]
    fn unparseable_address_skips_only_that_line() {
        let snapshot = HostsSnapshot::parse(
            "127.0.0.1 ok\n\
             fe80::1%lo0 localhost\n\
             not-an-ip host\n\
             10.0.0.2 after\n",
        );
        assert_eq!(snapshot.get("ok"), Some(LOCALHOST));
        assert_eq!(snapshot.get("after"), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(snapshot.get("localhost"), None);
        assert_eq!(snapshot.get("host"), None);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn scoped_ipv6_line_does_not_prevent_startup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\nfe80::1%lo0 localhost\n").unwrap();

        let hosts = HostsFile::open(Some(&path), ReloadPolicy::Poll).unwrap();
        assert_eq!(hosts.lookup("localhost"), Some(LOCALHOST));
    }

    #[test]
    fn missing_file_is_a_startup_error() {
        let dir = TempDir::new().unwrap();
        let res = HostsFile::open(Some(&dir.path().join("absent")), ReloadPolicy::Poll);
        assert!(matches!(res, Err(HostsError::Io { .. })));
    }

    #[test]
    fn lookup_reads_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 entry1").unwrap();

        let hosts = HostsFile::open(Some(&path), ReloadPolicy::Poll).unwrap();
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));
        assert_eq!(hosts.lookup("entry2"), None);
    }

    #[test]
    fn poll_policy_reloads_changed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1   entry1").unwrap();

        let hosts = HostsFile::open(Some(&path), ReloadPolicy::Poll).unwrap();
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));

        write_hosts(&path, "127.0.0.1   entry2 foobar", 5);
        assert_eq!(hosts.lookup("foobar"), Some(LOCALHOST));
        assert_eq!(hosts.lookup("entry1"), None);
    }

    #[test]
    fn batch_operation_suspends_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 entry1").unwrap();
        let hosts = HostsFile::open(Some(&path), ReloadPolicy::Poll).unwrap();

        hosts.batch_operation(true);
        write_hosts(&path, "127.0.0.1 entry2", 5);
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));
        assert_eq!(hosts.lookup("entry2"), None);

        hosts.batch_operation(false);
        assert_eq!(hosts.lookup("entry2"), Some(LOCALHOST));
        assert_eq!(hosts.lookup("entry1"), None);
    }

    #[test]
    fn failed_reparse_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 entry1").unwrap();
        let hosts = HostsFile::open(Some(&path), ReloadPolicy::Poll).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));
        assert!(matches!(hosts.reload(), Err(HostsError::Io { .. })));
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));

        // Restoring the file is picked up on the next lookup.
        write_hosts(&path, "10.1.1.1 entry1\n", 10);
        assert_eq!(hosts.lookup("entry1"), Some(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[tokio::test]
    async fn watch_policy_reloads_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1   entry1").unwrap();

        let hosts = Arc::new(HostsFile::open(Some(&path), ReloadPolicy::Watch).unwrap());
        let watcher = hosts.watch();
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));

        // Give the watcher a moment to attach before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, "127.0.0.1   entry2 foobar").unwrap();

        let mut reloaded = false;
        for _ in 0..100 {
            if hosts.lookup("foobar") == Some(LOCALHOST) {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(reloaded, "watcher never picked up the rewritten file");
        assert_eq!(hosts.lookup("entry1"), None);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn watch_attach_failure_keeps_serving_last_snapshot() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("etc");
        std::fs::create_dir(&sub).unwrap();
        let path = sub.join("hosts");
        std::fs::write(&path, "127.0.0.1 entry1").unwrap();

        let hosts = Arc::new(HostsFile::open(Some(&path), ReloadPolicy::Watch).unwrap());
        std::fs::remove_dir_all(&sub).unwrap();

        // The watched directory is gone, so attaching fails and the task ends.
        let watcher = hosts.watch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hosts.lookup("entry1"), Some(LOCALHOST));

        tokio::time::timeout(Duration::from_secs(5), watcher.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn concurrent_lookups_never_see_torn_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        let names: Vec<String> = (0..64).map(|i| format!("host{}", i)).collect();
        let file_for = |ip: &str| {
            names
                .iter()
                .map(|n| format!("{} {}\n", ip, n))
                .collect::<String>()
        };
        let first = file_for("10.0.0.1");
        let second = file_for("10.0.0.2");
        std::fs::write(&path, &first).unwrap();

        let hosts = Arc::new(HostsFile::open(Some(&path), ReloadPolicy::Watch).unwrap());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let hosts = Arc::clone(&hosts);
                let names = names.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = hosts.snapshot();
                        let seen = snapshot.get(&names[0]).unwrap();
                        assert!(names.iter().all(|n| snapshot.get(n) == Some(seen)));
                    }
                })
            })
            .collect();

        for i in 0..50 {
            let content = if i % 2 == 0 { &second } else { &first };
            std::fs::write(&path, content).unwrap();
            hosts.reload().unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
