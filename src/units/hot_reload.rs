//! Hot reload of configuration and certificate directories.
//!
//! A [`notify`] watcher runs on its own OS thread and posts raw events into
//! an unbounded channel; a dispatcher task on the tokio loop consumes them,
//! so cache, metrics and scanner are only ever touched from the loop. Bursts
//! of events are debounced per file path before any action runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use foldhash::{HashMap, HashMapExt};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::center::Center;
use crate::config::{self, Config};
use crate::units::scanner::Scanner;

/// Debounce window for certificate file events.
const CERT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Debounce window for configuration file events.
const CONFIG_DEBOUNCE: Duration = Duration::from_secs(2);

//------------ FileEventKind -------------------------------------------------

/// The meaningful filesystem event kinds.
///
/// `close-after-write` events fold into `Created`: they signal that a newly
/// written file has been finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl std::fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Moved => "moved",
        })
    }
}

fn map_event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Remove(_) => Some(FileEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileEventKind::Moved),
        EventKind::Modify(_) => Some(FileEventKind::Modified),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(FileEventKind::Created),
        _ => None,
    }
}

//------------ HotReload -----------------------------------------------------

struct WatchState {
    watcher: RecommendedWatcher,
    dispatcher: JoinHandle<()>,
    watched: HashSet<Utf8PathBuf>,
}

/// The hot-reload coordinating unit.
pub struct HotReload {
    center: Arc<Center>,
    scanner: Arc<Scanner>,

    state: Mutex<Option<WatchState>>,

    // Debounce bookkeeping: at most one in-flight task per certificate path
    // and a single slot for the configuration file.
    cert_tasks: Mutex<HashMap<Utf8PathBuf, JoinHandle<()>>>,
    config_task: Mutex<Option<JoinHandle<()>>>,
}

impl HotReload {
    pub fn new(center: Arc<Center>, scanner: Arc<Scanner>) -> Arc<Self> {
        Arc::new(Self {
            center,
            scanner,
            state: Mutex::new(None),
            cert_tasks: Mutex::new(HashMap::new()),
            config_task: Mutex::new(None),
        })
    }

    /// Start watching the configuration file and the monitored directories.
    pub fn start(self: &Arc<Self>) -> Result<(), String> {
        let config = self.center.config.load_full();
        if !config.hot_reload {
            info!("Hot reload disabled in configuration");
            return Ok(());
        }
        if self.state.lock().expect("watch state lock").is_some() {
            warn!("Hot reload already started");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // This closure runs on the watcher's own thread; the channel is
            // the only bridge to the event loop.
            match res {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        warn!("Dropping filesystem event: event loop closed");
                    }
                }
                Err(err) => warn!("Filesystem watcher error: {err}"),
            }
        })
        .map_err(|err| format!("could not create filesystem watcher: {err}"))?;

        let mut watched = HashSet::new();

        if let Some(config_path) = &self.center.config_path {
            if let Some(config_dir) = config_path.parent().filter(|dir| dir.exists()) {
                match watcher.watch(config_dir.as_std_path(), RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        watched.insert(config_dir.to_owned());
                        info!("Watching configuration file: {config_path}");
                    }
                    Err(err) => warn!("Could not watch configuration directory: {err}"),
                }
            }
        }

        for dir in &config.certificate_directories {
            if !dir.is_dir() {
                warn!("Certificate directory does not exist: {dir}");
                continue;
            }
            match watcher.watch(dir.as_std_path(), RecursiveMode::Recursive) {
                Ok(()) => {
                    watched.insert(dir.clone());
                    info!("Watching certificate directory: {dir}");
                }
                Err(err) => warn!("Could not watch certificate directory {dir}: {err}"),
            }
        }

        let this = self.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_event(event);
            }
        });

        let watched_count = watched.len();
        *self.state.lock().expect("watch state lock") = Some(WatchState {
            watcher,
            dispatcher,
            watched,
        });
        info!("Hot reload started - Watching {watched_count} paths");
        Ok(())
    }

    /// Stop the watcher, the dispatcher and all pending debounce tasks.
    pub fn stop(&self) {
        self.stop_watching(true);
    }

    fn stop_watching(&self, cancel_config_task: bool) {
        let state = self.state.lock().expect("watch state lock").take();
        if let Some(state) = state {
            // Dropping the watcher joins its thread.
            drop(state.watcher);
            state.dispatcher.abort();
            info!("Hot reload stopped");
        }

        for (_, task) in self.cert_tasks.lock().expect("cert task map").drain() {
            task.abort();
        }
        if cancel_config_task {
            if let Some(task) = self.config_task.lock().expect("config task slot").take() {
                task.abort();
            }
        }
    }

    /// Route one raw watcher event. Runs on the dispatcher task.
    fn handle_event(self: &Arc<Self>, event: Event) {
        let Some(kind) = map_event_kind(&event.kind) else {
            return;
        };

        for path in &event.paths {
            // Directory events carry no certificate information.
            if path.is_dir() {
                continue;
            }
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };

            if self.is_config_event(path) {
                info!("Configuration file modified: {path}");
                self.schedule_config_change();
            } else if Config::is_supported_extension(path) {
                debug!("Certificate file event: {kind} - {path}");
                self.schedule_certificate_change(path.to_owned(), kind);
            }
        }
    }

    /// Whether an event path resolves to the configured config file.
    ///
    /// Editor temp files (dotfiles, names containing `.tmp`) are ignored.
    fn is_config_event(&self, path: &Utf8Path) -> bool {
        let Some(config_path) = &self.center.config_path else {
            return false;
        };
        let name = path.file_name().unwrap_or_default();
        if name.starts_with('.') || name.contains(".tmp") {
            return false;
        }
        match (path.canonicalize_utf8(), config_path.canonicalize_utf8()) {
            (Ok(event_path), Ok(config_path)) => event_path == config_path,
            _ => false,
        }
    }

    /// Arm (or re-arm) the debounce task for one certificate path.
    fn schedule_certificate_change(self: &Arc<Self>, path: Utf8PathBuf, kind: FileEventKind) {
        let mut tasks = self.cert_tasks.lock().expect("cert task map");
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.remove(&path) {
            previous.abort();
        }

        let this = self.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(CERT_DEBOUNCE).await;
            this.handle_certificate_change(&task_path, kind).await;
        });
        tasks.insert(path, handle);
    }

    /// Arm (or re-arm) the single config debounce task.
    fn schedule_config_change(self: &Arc<Self>) {
        let mut slot = self.config_task.lock().expect("config task slot");
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(CONFIG_DEBOUNCE).await;
            this.handle_config_change().await;
        }));
    }

    /// The debounced reaction to a certificate file change.
    ///
    /// Full invalidation is deliberately cheap: clearing the cache and every
    /// labeled series and re-scanning keeps the metrics consistent with the
    /// filesystem for any event kind.
    async fn handle_certificate_change(&self, path: &Utf8Path, kind: FileEventKind) {
        self.center.cache.clear().await;
        self.center.metrics.clear_all_certificate_metrics();
        self.center.metrics.reset_scan_metrics();
        info!("Cache and metrics cleared due to certificate {kind}: {path}");

        info!("Triggering re-scan due to certificate {kind}: {path}");
        self.scanner.scan_once().await;
    }

    /// The debounced reaction to a configuration file change.
    async fn handle_config_change(self: &Arc<Self>) {
        info!("Reloading configuration due to file change");

        let config_path = self.center.config_path.clone();
        let new_config = match config::load(config_path.as_deref()) {
            Ok(config) => config,
            Err(err) => {
                error!("Error reloading configuration: {err}");
                return;
            }
        };

        let old_config = self.center.config.load_full();
        let diff = ConfigDiff::between(&old_config, &new_config);

        // Swap the snapshot before acting so every triggered operation sees
        // the new configuration.
        self.center.config.store(Arc::new(new_config.clone()));
        if let Some(logger) = self.center.logger {
            if let Err(err) = logger.apply(&new_config) {
                warn!("Could not apply new log settings: {err}");
            }
        }

        if diff.material() {
            self.center.cache.clear().await;
            info!("Cache cleared due to configuration changes");
        }

        // Exclusion changes retract labeled series too: a certificate that
        // is now excluded will never be revisited by the re-scan.
        if diff.dirs_changed() || diff.exclude_dirs_changed || diff.exclude_patterns_changed {
            self.center.metrics.clear_all_certificate_metrics();
            self.center.metrics.reset_scan_metrics();
            info!("Metrics cleared and reset due to directory or exclusion changes");
        }
        if diff.dirs_changed() {
            self.update_watched_directories(&diff);
        }

        if diff.passwords_changed {
            // A previously failing PKCS#12 file may parse with new passwords.
            self.center.metrics.reset_parse_error_metrics();
            info!("Parse error metrics reset due to password changes");
        }

        let changes = diff.summary(&old_config, &new_config);
        if changes.is_empty() {
            info!("Configuration reloaded (no significant changes detected)");
        } else {
            info!("Configuration updated: {}", changes.join("; "));
        }

        if diff.material() {
            info!("Triggering certificate re-scan due to configuration changes");
            self.scanner.scan_once().await;
        }
    }

    /// Adjust the watch set after the monitored directories changed.
    ///
    /// Removing a watch is not supported uniformly across backends, so any
    /// removal restarts the watcher; add-only changes add watches in place.
    fn update_watched_directories(self: &Arc<Self>, diff: &ConfigDiff) {
        if !diff.dirs_removed.is_empty() {
            info!("Restarting file watcher due to directory changes");
            self.stop_watching(false);
            if let Err(err) = self.start() {
                error!("Failed to restart file watcher: {err}");
            }
            return;
        }

        let mut state = self.state.lock().expect("watch state lock");
        let Some(state) = state.as_mut() else {
            return;
        };
        for dir in &diff.dirs_added {
            if !dir.is_dir() {
                warn!("New certificate directory does not exist: {dir}");
                continue;
            }
            match state.watcher.watch(dir.as_std_path(), RecursiveMode::Recursive) {
                Ok(()) => {
                    state.watched.insert(dir.clone());
                    info!("Started watching new directory: {dir}");
                }
                Err(err) => warn!("Could not watch new directory {dir}: {err}"),
            }
        }
    }
}

//------------ ConfigDiff ----------------------------------------------------

/// The differences between two configuration snapshots that drive
/// invalidation.
#[derive(Debug, Default)]
struct ConfigDiff {
    dirs_added: Vec<Utf8PathBuf>,
    dirs_removed: Vec<Utf8PathBuf>,
    passwords_changed: bool,
    exclude_dirs_changed: bool,
    exclude_patterns_changed: bool,
    interval_delta_secs: u64,
    workers_changed: bool,
}

impl ConfigDiff {
    fn between(old: &Config, new: &Config) -> Self {
        let old_dirs: HashSet<&Utf8PathBuf> = old.certificate_directories.iter().collect();
        let new_dirs: HashSet<&Utf8PathBuf> = new.certificate_directories.iter().collect();

        let old_passwords: HashSet<&String> = old.p12_passwords.iter().collect();
        let new_passwords: HashSet<&String> = new.p12_passwords.iter().collect();

        let old_exclude_dirs: HashSet<&Utf8PathBuf> = old.exclude_directories.iter().collect();
        let new_exclude_dirs: HashSet<&Utf8PathBuf> = new.exclude_directories.iter().collect();

        let old_patterns: HashSet<&String> = old.exclude_file_patterns.iter().collect();
        let new_patterns: HashSet<&String> = new.exclude_file_patterns.iter().collect();

        Self {
            dirs_added: new_dirs
                .difference(&old_dirs)
                .map(|dir| (*dir).clone())
                .collect(),
            dirs_removed: old_dirs
                .difference(&new_dirs)
                .map(|dir| (*dir).clone())
                .collect(),
            passwords_changed: old_passwords != new_passwords,
            exclude_dirs_changed: old_exclude_dirs != new_exclude_dirs,
            exclude_patterns_changed: old_patterns != new_patterns,
            interval_delta_secs: old
                .scan_interval
                .as_secs()
                .abs_diff(new.scan_interval.as_secs()),
            workers_changed: old.workers != new.workers,
        }
    }

    fn dirs_changed(&self) -> bool {
        !self.dirs_added.is_empty() || !self.dirs_removed.is_empty()
    }

    /// Whether the change invalidates cached parse results.
    fn material(&self) -> bool {
        self.dirs_changed()
            || self.passwords_changed
            || self.exclude_dirs_changed
            || self.exclude_patterns_changed
            || self.interval_delta_secs > 60
    }

    /// Human-readable change lines for the reload log message.
    fn summary(&self, old: &Config, new: &Config) -> Vec<String> {
        let mut changes = Vec::new();
        if !self.dirs_added.is_empty() {
            changes.push(format!("Added directories: {:?}", self.dirs_added));
        }
        if !self.dirs_removed.is_empty() {
            changes.push(format!("Removed directories: {:?}", self.dirs_removed));
        }
        if old.scan_interval != new.scan_interval {
            changes.push(format!(
                "Scan interval: {} -> {}",
                old.scan_interval, new.scan_interval
            ));
        }
        if self.workers_changed {
            changes.push(format!("Workers: {} -> {}", old.workers, new.workers));
        }
        if self.passwords_changed {
            changes.push(format!(
                "P12 passwords: {} -> {}",
                old.p12_passwords.len(),
                new.p12_passwords.len()
            ));
        }
        if self.exclude_dirs_changed {
            changes.push(format!(
                "Exclude directories: {:?} -> {:?}",
                old.exclude_directories, new.exclude_directories
            ));
        }
        if self.exclude_patterns_changed {
            changes.push(format!(
                "Exclude patterns: {:?} -> {:?}",
                old.exclude_file_patterns, new.exclude_file_patterns
            ));
        }
        changes
    }
}
