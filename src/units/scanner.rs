//! The certificate scanner.
//!
//! Walks every monitored directory, filters candidate files, parses them on
//! a bounded worker pool and feeds the results into the metrics registry.
//! The parse cache is consulted per file, keyed by path and mtime, so an
//! unchanged file is never parsed twice.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::join_all;
use futures_util::FutureExt;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{DirectoryScan, DiskUsage, ScanOutcome, ScanStatus, ScanSummary, ScannerHealth};
use crate::cache::Cache;
use crate::center::Center;
use crate::cert::{self, CertificateRecord};
use crate::config::Config;
use crate::metrics::MetricsCollection;
use crate::util;

/// How long the periodic loop backs off after a scan blew up.
const SCAN_RETRY_DELAY: Duration = Duration::from_secs(60);

//------------ Scanner -------------------------------------------------------

/// The scanning unit.
#[derive(Debug)]
pub struct Scanner {
    center: Arc<Center>,

    /// Serializes scans; concurrent `scan_once` calls queue up here.
    scan_lock: tokio::sync::Mutex<()>,

    scanning: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(center: Arc<Center>) -> Arc<Self> {
        let workers = center.config.load().workers;
        info!("Certificate scanner initialized - Workers: {workers}");
        Arc::new(Self {
            center,
            scan_lock: tokio::sync::Mutex::new(()),
            scanning: AtomicBool::new(false),
            scan_task: Mutex::new(None),
        })
    }

    /// Start the periodic scanning loop.
    pub fn start_scanning(self: &Arc<Self>) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            warn!("Scanner is already running");
            return;
        }

        let scanner = self.clone();
        let handle = tokio::spawn(async move { scanner.scan_loop().await });
        *self.scan_task.lock().expect("scan task slot") = Some(handle);

        let interval = self.center.config.load().scan_interval;
        info!("Started certificate scanning - Interval: {interval}");
    }

    /// Stop the periodic loop and wait for it to wind down.
    pub async fn stop(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        let handle = self.scan_task.lock().expect("scan task slot").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("Certificate scanner stopped");
    }

    async fn scan_loop(self: Arc<Self>) {
        while self.scanning.load(Ordering::SeqCst) {
            let scanner = self.clone();
            let result = std::panic::AssertUnwindSafe(async move {
                scanner.scan_once().await;
            })
            .catch_unwind()
            .await;

            if result.is_err() {
                error!("Error in scan loop; retrying in {}s", SCAN_RETRY_DELAY.as_secs());
                tokio::time::sleep(SCAN_RETRY_DELAY).await;
                continue;
            }

            let interval = self.center.config.load().scan_interval.as_duration();
            tokio::time::sleep(interval).await;
        }
    }

    /// Perform a single scan of all configured directories.
    ///
    /// Scans serialize on an internal mutex; no two scans ever run
    /// concurrently.
    pub async fn scan_once(&self) -> ScanOutcome {
        let _guard = self.scan_lock.lock().await;

        let config = self.center.config.load_full();
        let metrics = &self.center.metrics;
        let start = Instant::now();
        let timestamp = util::now_secs();

        // The per-scan gauges restart from zero; every certificate update
        // below happens after this point.
        metrics.reset_scan_metrics();

        let mut summary = ScanSummary {
            directories_scanned: config.certificate_directories.len(),
            ..Default::default()
        };
        let mut directories = Vec::with_capacity(config.certificate_directories.len());

        for directory in &config.certificate_directories {
            let dir_start = Instant::now();
            match self.scan_directory(&config, directory).await {
                Ok(result) => {
                    let duration = dir_start.elapsed();
                    summary.total_files += result.files_processed;
                    summary.total_parsed += result.certificates_parsed;
                    summary.total_errors += result.parse_errors;

                    metrics.update_scan_metrics(
                        directory.as_str(),
                        duration,
                        result.files_processed,
                        result.certificates_parsed,
                        result.parse_errors,
                    );

                    info!(
                        "Scanned {directory} in {:.2}s: {} parsed, {} errors",
                        duration.as_secs_f64(),
                        result.certificates_parsed,
                        result.parse_errors,
                    );
                    directories.push(result);
                }
                Err(err) => {
                    error!("Failed to scan directory {directory}: {err}");
                    summary.total_errors += 1;
                    directories.push(DirectoryScan::failed(directory.clone(), err));
                }
            }
        }

        summary.total_duration = start.elapsed().as_secs_f64();
        info!(
            "Scan completed - Duration: {:.2}s, Files: {}, Parsed: {}, Errors: {}",
            summary.total_duration, summary.total_files, summary.total_parsed, summary.total_errors
        );

        ScanOutcome {
            summary,
            directories,
            timestamp,
        }
    }

    /// Scan a single directory.
    async fn scan_directory(
        &self,
        config: &Arc<Config>,
        directory: &Utf8Path,
    ) -> Result<DirectoryScan, String> {
        if !directory.exists() {
            return Err(format!("Directory does not exist: {directory}"));
        }
        if !directory.is_dir() {
            return Err(format!("Path is not a directory: {directory}"));
        }

        // Discovery runs on a blocking thread; directory trees can be large.
        let walk_root = directory.to_owned();
        let exclude_dirs = resolve_exclude_dirs(&config.exclude_directories);
        let patterns = config.compiled_exclude_patterns();
        let cert_files = tokio::task::spawn_blocking(move || {
            find_certificate_files(&walk_root, &exclude_dirs, &patterns)
        })
        .await
        .map_err(|err| format!("Discovery failed: {err}"))?;

        debug!("Scanning {directory}: {} candidate files", cert_files.len());

        // Parse candidates in parallel, throttled to the configured worker
        // count.
        let semaphore = Arc::new(Semaphore::new(config.workers));
        let tasks: Vec<_> = cert_files
            .into_iter()
            .map(|file| {
                let semaphore = semaphore.clone();
                let cache = self.center.cache.clone();
                let metrics = self.center.metrics.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    process_certificate_file(file, semaphore, cache, metrics, config).await
                })
            })
            .collect();

        let mut files_processed = 0;
        let mut certificates_parsed = 0;
        let mut parse_errors = 0;
        let mut certificates = Vec::new();

        for result in join_all(tasks).await {
            files_processed += 1;
            match result {
                Ok(Some(record)) => {
                    certificates_parsed += 1;
                    self.center.metrics.update_certificate_metrics(&record);
                    certificates.push(record);
                }
                Ok(None) => parse_errors += 1,
                Err(err) => {
                    parse_errors += 1;
                    error!("Parse task failed: {err}");
                }
            }
        }

        Ok(DirectoryScan {
            directory: directory.to_owned(),
            files_processed,
            certificates_parsed,
            parse_errors,
            certificates,
            disk_usage: disk_usage(directory),
            error: None,
        })
    }

    /// The scanner fragment of the health endpoint.
    pub fn health_status(&self) -> ScannerHealth {
        let config = self.center.config.load();
        ScannerHealth {
            cert_scan_status: if self.scanning.load(Ordering::SeqCst) {
                ScanStatus::Running
            } else {
                ScanStatus::Stopped
            },
            certificate_directories: config.certificate_directories.clone(),
            worker_pool_size: config.workers,
        }
    }
}

//------------ Discovery -----------------------------------------------------

/// Canonicalize the configured exclude directories for containment checks.
fn resolve_exclude_dirs(exclude: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    exclude
        .iter()
        .map(|dir| dir.canonicalize_utf8().unwrap_or_else(|_| dir.clone()))
        .collect()
}

/// Whether a directory path equals or descends into an excluded directory.
fn is_excluded_dir(path: &Path, exclude_dirs: &[Utf8PathBuf]) -> bool {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    exclude_dirs
        .iter()
        .any(|excluded| resolved.starts_with(excluded.as_std_path()))
}

/// Recursively collect candidate certificate files.
///
/// Excluded subtrees are pruned, unsupported extensions skipped, and file
/// names matching any exclude pattern dropped. Walk errors skip the affected
/// entry.
fn find_certificate_files(
    directory: &Utf8Path,
    exclude_dirs: &[Utf8PathBuf],
    patterns: &[Regex],
) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();

    let walker = walkdir::WalkDir::new(directory)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir() && is_excluded_dir(entry.path(), exclude_dirs))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Error walking directory {directory}: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            warn!("Skipping non-UTF-8 path: {}", entry.path().display());
            continue;
        };
        if !Config::is_supported_extension(path) {
            continue;
        }
        let name = path.file_name().unwrap_or_default();
        if let Some(pattern) = patterns.iter().find(|re| re.is_match(name)) {
            debug!("Excluding file {name} (matches pattern: {pattern})");
            continue;
        }
        files.push(path.to_owned());
    }

    files
}

//------------ Per-file processing -------------------------------------------

/// Parse one candidate file, consulting the cache first.
///
/// Returns the record on success; a parse failure is recorded in the
/// metrics and yields `None`.
async fn process_certificate_file(
    path: Utf8PathBuf,
    semaphore: Arc<Semaphore>,
    cache: Arc<Cache>,
    metrics: Arc<MetricsCollection>,
    config: Arc<Config>,
) -> Option<CertificateRecord> {
    let _permit = semaphore.acquire_owned().await.ok()?;
    let filename = path.file_name().unwrap_or_default().to_string();

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(err) => {
            metrics.record_parse_error(&filename, "io_error", &err.to_string());
            warn!("Could not stat {path}: {err}");
            return None;
        }
    };
    let mtime = cert::file_mtime(&meta);
    let key = Cache::make_key(&["cert", path.as_str(), &mtime.to_string()]);

    if let Some(value) = cache.get(&key).await {
        match serde_json::from_value::<CertificateRecord>(value) {
            Ok(record) => return Some(record),
            // A cached value from an incompatible version; re-parse.
            Err(err) => debug!("Discarding unreadable cache entry for {path}: {err}"),
        }
    }

    let parse_path = path.clone();
    let passwords = config.p12_passwords.clone();
    let parsed =
        tokio::task::spawn_blocking(move || cert::parse_certificate_file(&parse_path, &passwords))
            .await;

    match parsed {
        Ok(Ok(record)) => {
            cache.set(&key, &record).await;
            debug!(
                "Parsed {path}: CN {}, expires in {} days",
                record.common_name, record.days_until_expiry
            );
            Some(record)
        }
        Ok(Err(err)) => {
            metrics.record_parse_error(&filename, err.kind(), &err.to_string());
            warn!("Failed to parse {path}: {err}");
            None
        }
        Err(err) => {
            metrics.record_parse_error(&filename, "task_failure", &err.to_string());
            error!("Parse task for {path} failed: {err}");
            None
        }
    }
}

/// Disk usage of the filesystem holding a directory.
///
/// The directory is matched to the disk with the longest mount-point prefix.
pub(crate) fn disk_usage(directory: &Utf8Path) -> DiskUsage {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<(usize, DiskUsage)> = None;

    for disk in disks.list() {
        let Some(mount) = disk.mount_point().to_str() else {
            continue;
        };
        if !directory.as_str().starts_with(mount) {
            continue;
        }
        let total = disk.total_space();
        let free = disk.available_space();
        let usage = DiskUsage {
            total,
            used: total.saturating_sub(free),
            free,
        };
        if best.map(|(len, _)| mount.len() > len).unwrap_or(true) {
            best = Some((mount.len(), usage));
        }
    }

    best.map(|(_, usage)| usage).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_support::{cert_pem, cert_pkcs12, CertSpec};
    use crate::config::CacheType;

    fn test_center(dir: &Utf8Path, mutate: impl FnOnce(&mut Config)) -> Arc<Center> {
        let mut config = Config {
            certificate_directories: vec![dir.to_owned()],
            cache_type: CacheType::Memory,
            workers: 2,
            hot_reload: false,
            ..Default::default()
        };
        mutate(&mut config);
        Center::new(config, None, None)
    }

    fn tmpdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn scan_parses_certificates_and_updates_metrics() {
        let (_guard, dir) = tmpdir();
        std::fs::write(
            dir.join("a.pem"),
            cert_pem(&CertSpec {
                cn: "a.example",
                serial: "1111",
                san_dns: &["a.example"],
                ..Default::default()
            }),
        )
        .unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_files, 1);
        assert_eq!(outcome.summary.total_parsed, 1);
        assert_eq!(outcome.summary.total_errors, 0);
        assert_eq!(outcome.summary.directories_scanned, 1);
        assert_eq!(outcome.directories.len(), 1);
        assert_eq!(outcome.directories[0].certificates[0].common_name, "a.example");

        let text = center.metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_expiration_timestamp{common_name=\"a.example\""));
        assert!(text.contains("ssl_certs_parsed_total 1"));
    }

    #[tokio::test]
    async fn invalid_files_are_counted_without_stopping_the_scan() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("good.pem"), cert_pem(&CertSpec::default())).unwrap();
        std::fs::write(dir.join("invalid.pem"), b"not a cert").unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_files, 2);
        assert_eq!(outcome.summary.total_parsed, 1);
        assert_eq!(outcome.summary.total_errors, 1);

        let text = center.metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_parse_errors_total 1"));
        assert!(text.contains("ssl_cert_parse_error_names{filename=\"invalid.pem\""));
        assert!(text.contains("ssl_certs_parsed_total 1"));
    }

    #[tokio::test]
    async fn duplicate_serials_are_reported() {
        let (_guard, dir) = tmpdir();
        std::fs::write(
            dir.join("a.pem"),
            cert_pem(&CertSpec {
                cn: "a.example",
                serial: "12345",
                ..Default::default()
            }),
        )
        .unwrap();
        std::fs::write(
            dir.join("b.pem"),
            cert_pem(&CertSpec {
                cn: "b.example",
                serial: "12345",
                ..Default::default()
            }),
        )
        .unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        scanner.scan_once().await;

        let text = center.metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_duplicate_count 1"));
        assert!(text.contains("ssl_cert_duplicate_names{serial_number=\"12345\""));
    }

    #[tokio::test]
    async fn weak_keys_are_tallied() {
        let (_guard, dir) = tmpdir();
        std::fs::write(
            dir.join("weak.pem"),
            cert_pem(&CertSpec {
                cn: "weak.example",
                key_bits: 1024,
                ..Default::default()
            }),
        )
        .unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        scanner.scan_once().await;

        let text = center.metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_weak_key_total 1"));
    }

    #[tokio::test]
    async fn pkcs12_files_parse_with_the_configured_passwords() {
        let (_guard, dir) = tmpdir();
        std::fs::write(
            dir.join("bundle.p12"),
            cert_pkcs12(
                &CertSpec {
                    cn: "p12.example",
                    ..Default::default()
                },
                "changeit",
            ),
        )
        .unwrap();

        let center = test_center(&dir, |config| {
            config.p12_passwords = vec!["".into(), "changeit".into()];
        });
        let scanner = Scanner::new(center.clone());
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_parsed, 1);
        let text = center.metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_expiration_timestamp{common_name=\"p12.example\""));
    }

    #[tokio::test]
    async fn exclude_patterns_and_extensions_filter_discovery() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("keep.pem"), cert_pem(&CertSpec::default())).unwrap();
        std::fs::write(dir.join("dhparam.pem"), cert_pem(&CertSpec::default())).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center);
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_files, 1);
        assert_eq!(outcome.directories[0].certificates[0].filename, "keep.pem");
    }

    #[tokio::test]
    async fn excluded_directories_are_pruned() {
        let (_guard, dir) = tmpdir();
        let nested = dir.join("backup");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.join("keep.pem"), cert_pem(&CertSpec::default())).unwrap();
        std::fs::write(nested.join("old.pem"), cert_pem(&CertSpec::default())).unwrap();

        let center = test_center(&dir, |config| {
            config.exclude_directories = vec![nested.clone()];
        });
        let scanner = Scanner::new(center);
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_files, 1);
    }

    #[tokio::test]
    async fn missing_directory_yields_an_error_entry() {
        let (_guard, dir) = tmpdir();
        let missing = dir.join("gone");

        let center = test_center(&missing, |_| ());
        let scanner = Scanner::new(center);
        let outcome = scanner.scan_once().await;

        assert_eq!(outcome.summary.total_errors, 1);
        assert_eq!(outcome.directories.len(), 1);
        assert!(outcome.directories[0].error.is_some());
        assert_eq!(outcome.directories[0].parse_errors, 1);
    }

    #[tokio::test]
    async fn second_scan_hits_the_cache() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("a.pem"), cert_pem(&CertSpec::default())).unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        scanner.scan_once().await;
        let before = center.cache.stats().await;
        assert_eq!(before.cache_hits, 0);

        scanner.scan_once().await;
        let after = center.cache.stats().await;
        assert_eq!(after.cache_hits, 1);
        assert_eq!(after.entries_total, 1);
    }

    #[tokio::test]
    async fn concurrent_scans_serialize() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("a.pem"), cert_pem(&CertSpec::default())).unwrap();

        let center = test_center(&dir, |_| ());
        let scanner = Scanner::new(center);
        let (a, b) = tokio::join!(scanner.scan_once(), scanner.scan_once());
        assert_eq!(a.summary.total_parsed, 1);
        assert_eq!(b.summary.total_parsed, 1);
    }

    #[tokio::test]
    async fn health_status_reflects_configuration() {
        let (_guard, dir) = tmpdir();
        let center = test_center(&dir, |config| config.workers = 7);
        let scanner = Scanner::new(center);
        let health = scanner.health_status();
        assert_eq!(health.worker_pool_size, 7);
        assert_eq!(health.certificate_directories, vec![dir]);
        assert!(matches!(health.cert_scan_status, ScanStatus::Stopped));
    }
}
