//! Maintaining and outputting metrics.
//!
//! Relevant sources for metric names and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/instrumenting/writing_exporters/#labels
//!
//! Two kinds of metric live here. Cumulative, per-directory values
//! (`ssl_cert_files_total`, the scan histogram, last-scan timestamps) keep
//! their label sets across scans. Current-scan gauges
//! (`ssl_certs_parsed_total`, `ssl_cert_parse_errors_total`,
//! `ssl_cert_weak_key_total`, `ssl_cert_deprecated_sigalg_total`,
//! `ssl_cert_duplicate_count`) are zeroed by [`MetricsCollection::
//! reset_scan_metrics`] before every scan. The `_total` suffix on the two
//! scan counters is kept for dashboard compatibility even though they are
//! gauges.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, LazyLock};
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use regex::Regex;
use tracing::{debug, warn};

use crate::cert::CertificateRecord;

/// The exposition content type of the `/metrics` endpoint.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// How often the process-level metrics are refreshed at most.
const SYSTEM_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Parse-error messages are truncated to this many characters in labels.
const ERROR_MESSAGE_MAX: usize = 100;

/// Metrics whose exposition values are forced to integers when integral.
///
/// The post-processor matches on metric *names*; keep this list in sync with
/// the families below.
const INTEGER_METRICS: &[&str] = &[
    "ssl_cert_last_scan_timestamp",
    "ssl_cert_san_count",
    "ssl_cert_files_total",
    "ssl_cert_duplicate_count",
    "app_memory_bytes",
    "app_thread_count",
    "ssl_cert_issuer_code",
];

/// The classic Prometheus histogram buckets, in seconds.
const SCAN_DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

//------------ Label sets ----------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ExpirationLabels {
    common_name: String,
    issuer: String,
    path: String,
    serial: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SanCountLabels {
    common_name: String,
    path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CertInfoLabels {
    path: String,
    common_name: String,
    issuer: String,
    serial: String,
    subject: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IssuerCodeLabels {
    common_name: String,
    issuer: String,
    path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DuplicateNameLabels {
    serial_number: String,
    certificate_paths: String,
    path_count: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DirectoryLabels {
    directory: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ParseErrorLabels {
    filename: String,
    error_type: String,
    error_message: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AppInfoLabels {
    hostname: String,
    version: String,
    lang_version: String,
}

fn scan_duration_histogram() -> Histogram {
    Histogram::new(SCAN_DURATION_BUCKETS.iter().copied())
}

//------------ MetricsCollection ---------------------------------------------

/// The metric families of the certificate monitor.
#[derive(Debug)]
pub struct MetricsCollection {
    registry: Registry,
    registered: usize,

    // Labeled certificate series. These persist until explicitly cleared;
    // `clear_all_certificate_metrics` drops every one of them.
    expiration: Family<ExpirationLabels, Gauge<f64, AtomicU64>>,
    san_count: Family<SanCountLabels, Gauge>,
    cert_info: Family<CertInfoLabels, Gauge>,
    issuer_code: Family<IssuerCodeLabels, Gauge>,
    duplicate_names: Family<DuplicateNameLabels, Gauge>,

    // Current-scan gauges.
    duplicate_count: Gauge,
    weak_key_total: Gauge,
    deprecated_sigalg_total: Gauge,
    parsed_total: Gauge,
    parse_errors_total: Gauge,

    // Per-directory scan bookkeeping.
    files_total: Family<DirectoryLabels, Gauge>,
    scan_duration: Family<DirectoryLabels, Histogram>,
    last_scan_timestamp: Family<DirectoryLabels, Gauge>,

    parse_error_names: Family<ParseErrorLabels, Gauge>,

    // Application metrics.
    app_memory_bytes: Family<Vec<(String, String)>, Gauge>,
    app_cpu_percent: Gauge<f64, AtomicU64>,
    app_thread_count: Gauge,
    app_info: Family<AppInfoLabels, Gauge>,

    // Internal per-scan tracking. The duplicate index maps a serial to the
    // paths reporting it within the current scan.
    duplicates: Mutex<HashMap<String, Vec<String>>>,
    scan_parsed: AtomicU64,
    scan_parse_errors: AtomicU64,
    scan_weak_keys: AtomicU64,
    scan_deprecated_sigalgs: AtomicU64,

    system: Mutex<SystemSampler>,
}

impl MetricsCollection {
    pub fn new() -> Self {
        let mut col = Self {
            registry: Registry::default(),
            registered: 0,
            expiration: Default::default(),
            san_count: Default::default(),
            cert_info: Default::default(),
            issuer_code: Default::default(),
            duplicate_names: Default::default(),
            duplicate_count: Default::default(),
            weak_key_total: Default::default(),
            deprecated_sigalg_total: Default::default(),
            parsed_total: Default::default(),
            parse_errors_total: Default::default(),
            files_total: Default::default(),
            scan_duration: Family::new_with_constructor(
                scan_duration_histogram as fn() -> Histogram,
            ),
            last_scan_timestamp: Default::default(),
            parse_error_names: Default::default(),
            app_memory_bytes: Default::default(),
            app_cpu_percent: Default::default(),
            app_thread_count: Default::default(),
            app_info: Default::default(),
            duplicates: Mutex::new(HashMap::new()),
            scan_parsed: AtomicU64::new(0),
            scan_parse_errors: AtomicU64::new(0),
            scan_weak_keys: AtomicU64::new(0),
            scan_deprecated_sigalgs: AtomicU64::new(0),
            system: Mutex::new(SystemSampler::new()),
        };

        col.register(
            "ssl_cert_expiration_timestamp",
            "Certificate expiration time (Unix timestamp)",
            col.expiration.clone(),
        );
        col.register(
            "ssl_cert_san_count",
            "Number of Subject Alternative Names",
            col.san_count.clone(),
        );
        col.register(
            "ssl_cert_info",
            "Certificate information with labels",
            col.cert_info.clone(),
        );
        col.register(
            "ssl_cert_issuer_code",
            "Numeric issuer classification",
            col.issuer_code.clone(),
        );
        col.register(
            "ssl_cert_duplicate_count",
            "Number of duplicate certificates",
            col.duplicate_count.clone(),
        );
        col.register(
            "ssl_cert_duplicate_names",
            "Names of certificates that are duplicates",
            col.duplicate_names.clone(),
        );
        col.register(
            "ssl_cert_weak_key_total",
            "Current count of certificates with weak cryptographic keys",
            col.weak_key_total.clone(),
        );
        col.register(
            "ssl_cert_deprecated_sigalg_total",
            "Current count of certificates using deprecated signature algorithms",
            col.deprecated_sigalg_total.clone(),
        );
        col.register(
            "ssl_cert_files_total",
            "Total certificate files processed",
            col.files_total.clone(),
        );
        col.register(
            "ssl_certs_parsed_total",
            "Successfully parsed certificates",
            col.parsed_total.clone(),
        );
        col.register(
            "ssl_cert_parse_errors_total",
            "Current count of certificate parsing errors",
            col.parse_errors_total.clone(),
        );
        col.register(
            "ssl_cert_parse_error_names",
            "Names of certificates that have parsing errors",
            col.parse_error_names.clone(),
        );
        col.register(
            "ssl_cert_scan_duration_seconds",
            "Directory scan duration",
            col.scan_duration.clone(),
        );
        col.register(
            "ssl_cert_last_scan_timestamp",
            "Last successful scan time",
            col.last_scan_timestamp.clone(),
        );
        col.register(
            "app_memory_bytes",
            "Application memory usage in bytes",
            col.app_memory_bytes.clone(),
        );
        col.register(
            "app_cpu_percent",
            "Application CPU usage percentage",
            col.app_cpu_percent.clone(),
        );
        col.register(
            "app_thread_count",
            "Number of application threads",
            col.app_thread_count.clone(),
        );
        col.register("app_info", "Application information", col.app_info.clone());

        col
    }

    fn register(
        &mut self,
        name: &str,
        help: &str,
        metric: impl prometheus_client::registry::Metric,
    ) {
        self.registry.register(name, help, metric);
        self.registered += 1;
    }

    /// Feed one parsed certificate into the labeled families and the
    /// per-scan tallies.
    pub fn update_certificate_metrics(&self, record: &CertificateRecord) {
        let common_name = record.common_name.clone();
        let path = record.path.to_string();
        let serial = record.serial.clone();

        self.expiration
            .get_or_create(&ExpirationLabels {
                common_name: common_name.clone(),
                issuer: record.issuer.clone(),
                path: path.clone(),
                serial: serial.clone(),
            })
            .set(record.expiration_timestamp as f64);

        self.san_count
            .get_or_create(&SanCountLabels {
                common_name: common_name.clone(),
                path: path.clone(),
            })
            .set(record.san_count as i64);

        self.cert_info
            .get_or_create(&CertInfoLabels {
                path: path.clone(),
                common_name: common_name.clone(),
                issuer: record.issuer.clone(),
                serial: serial.clone(),
                subject: record.subject.clone(),
            })
            .set(1);

        self.issuer_code
            .get_or_create(&IssuerCodeLabels {
                common_name: common_name.clone(),
                issuer: record.issuer.clone(),
                path: path.clone(),
            })
            .set(issuer_code(&record.issuer));

        if serial != "unknown" {
            self.duplicates
                .lock()
                .expect("duplicate index lock")
                .entry(serial)
                .or_default()
                .push(path.clone());
        }

        if record.is_weak_key {
            self.scan_weak_keys.fetch_add(1, Ordering::Relaxed);
        }
        if record.is_deprecated_algorithm {
            self.scan_deprecated_sigalgs.fetch_add(1, Ordering::Relaxed);
        }

        debug!("Certificate processed: {common_name} ({path})");
    }

    /// Publish one directory's scan results and the accumulated current-scan
    /// gauges.
    pub fn update_scan_metrics(
        &self,
        directory: &str,
        duration: Duration,
        files_total: usize,
        parsed_total: usize,
        errors_total: usize,
    ) {
        let labels = DirectoryLabels {
            directory: directory.to_string(),
        };
        self.files_total.get_or_create(&labels).set(files_total as i64);
        self.scan_duration
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
        self.last_scan_timestamp
            .get_or_create(&labels)
            .set(jiff::Timestamp::now().as_second());

        // The unlabeled gauges carry totals accumulated across the scan's
        // directories, not the last directory's counts.
        let parsed = self
            .scan_parsed
            .fetch_add(parsed_total as u64, Ordering::Relaxed)
            + parsed_total as u64;
        self.parsed_total.set(parsed as i64);
        self.parse_errors_total
            .set(self.scan_parse_errors.load(Ordering::Relaxed) as i64);
        self.weak_key_total
            .set(self.scan_weak_keys.load(Ordering::Relaxed) as i64);
        self.deprecated_sigalg_total
            .set(self.scan_deprecated_sigalgs.load(Ordering::Relaxed) as i64);

        debug!(
            "Scan metrics updated: {directory} ({files_total} files, \
             {parsed_total} parsed, {errors_total} errors)"
        );
    }

    /// Record a certificate parse failure.
    pub fn record_parse_error(&self, filename: &str, error_type: &str, error_message: &str) {
        self.scan_parse_errors.fetch_add(1, Ordering::Relaxed);

        let error_message: String = error_message.chars().take(ERROR_MESSAGE_MAX).collect();
        self.parse_error_names
            .get_or_create(&ParseErrorLabels {
                filename: filename.to_string(),
                error_type: error_type.to_string(),
                error_message,
            })
            .set(1);
    }

    /// Reset the per-scan state before a new scan starts.
    ///
    /// Clears the duplicate index and zeroes the five current-scan gauges.
    pub fn reset_scan_metrics(&self) {
        self.duplicates.lock().expect("duplicate index lock").clear();
        self.scan_parsed.store(0, Ordering::Relaxed);
        self.scan_parse_errors.store(0, Ordering::Relaxed);
        self.scan_weak_keys.store(0, Ordering::Relaxed);
        self.scan_deprecated_sigalgs.store(0, Ordering::Relaxed);

        self.parsed_total.set(0);
        self.parse_errors_total.set(0);
        self.weak_key_total.set(0);
        self.deprecated_sigalg_total.set(0);
        self.duplicate_count.set(0);

        debug!("Scan metrics reset");
    }

    /// Drop every labeled certificate series.
    ///
    /// Invoked on certificate deletion, directory changes and
    /// exclude-pattern changes; labeled series would otherwise survive until
    /// process exit.
    pub fn clear_all_certificate_metrics(&self) {
        self.expiration.clear();
        self.san_count.clear();
        self.cert_info.clear();
        self.duplicate_names.clear();
        self.issuer_code.clear();
        debug!("All labeled certificate metrics cleared");
    }

    /// Drop recorded parse errors, e.g. after a password change makes a
    /// previously failing PKCS#12 file parseable.
    pub fn reset_parse_error_metrics(&self) {
        self.scan_parse_errors.store(0, Ordering::Relaxed);
        self.parse_errors_total.set(0);
        self.parse_error_names.clear();
        debug!("Parse error metrics reset");
    }

    /// Publish the duplicate index.
    fn update_duplicate_metrics(&self) {
        let duplicates = self.duplicates.lock().expect("duplicate index lock");
        let duplicated: Vec<(&String, &Vec<String>)> = duplicates
            .iter()
            .filter(|(_, paths)| paths.len() >= 2)
            .collect();

        self.duplicate_count.set(duplicated.len() as i64);
        for (serial, paths) in duplicated {
            self.duplicate_names
                .get_or_create(&DuplicateNameLabels {
                    serial_number: serial.clone(),
                    certificate_paths: paths.join(","),
                    path_count: paths.len().to_string(),
                })
                .set(1);
        }
    }

    /// Refresh process-level metrics, at most every 30 seconds.
    fn update_system_metrics(&self) {
        let mut sampler = self.system.lock().expect("system sampler lock");
        if sampler
            .last_update
            .map(|at| at.elapsed() < SYSTEM_UPDATE_INTERVAL)
            .unwrap_or(false)
        {
            return;
        }

        let Ok(pid) = sysinfo::get_current_pid() else {
            warn!("Could not determine our own process id");
            return;
        };
        sampler.sys.refresh_process(pid);
        if let Some(process) = sampler.sys.process(pid) {
            self.app_memory_bytes
                .get_or_create(&vec![("type".to_string(), "rss".to_string())])
                .set(process.memory() as i64);
            self.app_memory_bytes
                .get_or_create(&vec![("type".to_string(), "vms".to_string())])
                .set(process.virtual_memory() as i64);
            self.app_cpu_percent.set(process.cpu_usage() as f64);
            self.app_thread_count.set(thread_count(process) as i64);
        }

        self.app_info
            .get_or_create(&AppInfoLabels {
                hostname: hostname::get()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".into()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                lang_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            })
            .set(1);

        sampler.last_update = Some(Instant::now());
    }

    /// Turn the metrics into exposition text.
    ///
    /// Refreshes system metrics and the duplicate index first, then applies
    /// the integer rendering pass.
    pub fn assemble(&self) -> Result<String, fmt::Error> {
        self.update_system_metrics();
        self.update_duplicate_metrics();
        let raw = String::try_from(self)?;
        Ok(format_numeric_values(&raw))
    }

    /// The registry fragment of the health endpoint.
    pub fn registry_status(&self) -> serde_json::Value {
        let last_update = self
            .system
            .lock()
            .expect("system sampler lock")
            .last_update
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        serde_json::json!({
            "prometheus_registry": {
                "status": "healthy",
                "metrics_count": self.registered,
                "last_update_age_seconds": last_update,
            }
        })
    }
}

impl TryFrom<&MetricsCollection> for String {
    type Error = fmt::Error;

    fn try_from(metrics: &MetricsCollection) -> Result<Self, Self::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsCollection {
    fn default() -> Self {
        Self::new()
    }
}

//------------ SystemSampler -------------------------------------------------

struct SystemSampler {
    sys: sysinfo::System,
    last_update: Option<Instant>,
}

impl SystemSampler {
    fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
            last_update: None,
        }
    }
}

impl fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemSampler")
            .field("last_update", &self.last_update)
            .finish()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn thread_count(process: &sysinfo::Process) -> usize {
    process.tasks().map(|tasks| tasks.len()).unwrap_or(0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn thread_count(_process: &sysinfo::Process) -> usize {
    0
}

//------------ Numeric rendering ---------------------------------------------

/// Rewrite integral float values of selected metrics as integers.
///
/// The match is by metric name, so histogram buckets and CPU percentages are
/// left untouched.
fn format_numeric_values(text: &str) -> String {
    static LABELED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^}]+\})\s+(\S+)\s*$").expect("valid regex"));
    static UNLABELED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\S+)\s+(\S+)\s*$").expect("valid regex"));

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let formatted = if line.starts_with('#') || line.trim().is_empty() {
            None
        } else {
            LABELED
                .captures(line)
                .or_else(|| UNLABELED.captures(line))
                .and_then(|caps| {
                    let name = caps.get(1).expect("group").as_str();
                    let value = caps.get(2).expect("group").as_str();
                    if !INTEGER_METRICS.iter().any(|metric| name.contains(metric)) {
                        return None;
                    }
                    let parsed: f64 = value.parse().ok()?;
                    (parsed.is_finite() && parsed.fract() == 0.0)
                        .then(|| format!("{name} {}", parsed as i64))
                })
        };
        match formatted {
            Some(formatted) => out.push_str(&formatted),
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

//------------ Classification helpers ----------------------------------------

/// Whether a key falls below the per-algorithm strength threshold.
pub fn is_weak_key(key_size: u32, algorithm: &str) -> bool {
    let algorithm = algorithm.to_ascii_lowercase();

    // Check EC before RSA/DSA: the ECDSA family name contains both.
    if algorithm.contains("ec") || algorithm.contains("ecdsa") {
        key_size < 256
    } else if algorithm.contains("rsa") {
        key_size < 2048
    } else if algorithm.contains("dsa") {
        key_size < 2048
    } else {
        // Unknown algorithm: hold it to the RSA threshold.
        key_size < 2048
    }
}

/// Whether a signature algorithm uses a digest that is no longer acceptable.
pub fn is_deprecated_signature_algorithm(algorithm: &str) -> bool {
    let algorithm = algorithm.to_ascii_lowercase();
    ["md5", "sha1", "md2", "md4"]
        .iter()
        .any(|deprecated| algorithm.contains(deprecated))
}

/// The numeric issuer classification.
pub fn issuer_code(issuer: &str) -> i64 {
    let issuer = issuer.to_ascii_lowercase();
    if issuer.contains("digicert") {
        30
    } else if issuer.contains("amazon") || issuer.contains("aws") {
        31
    } else if ["self-signed", "localhost", "127.0.0.1"]
        .iter()
        .any(|keyword| issuer.contains(keyword))
    {
        33
    } else {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use jiff::Timestamp;

    fn record(cn: &str, serial: &str, path: &str) -> CertificateRecord {
        CertificateRecord {
            common_name: cn.to_string(),
            issuer: "Example CA".to_string(),
            subject: format!("CN={cn}"),
            serial: serial.to_string(),
            not_before: Timestamp::UNIX_EPOCH,
            not_after: Timestamp::from_second(1893456000).unwrap(),
            expiration_timestamp: 1893456000,
            days_until_expiry: 1000,
            key_size: 2048,
            key_algorithm: "RSA".to_string(),
            signature_algorithm: "sha256WithRSAEncryption".to_string(),
            san_list: vec![format!("DNS:{cn}")],
            san_count: 1,
            is_weak_key: false,
            is_deprecated_algorithm: false,
            version: 2,
            path: Utf8PathBuf::from(path),
            filename: Utf8PathBuf::from(path)
                .file_name()
                .unwrap_or_default()
                .to_string(),
            file_size: 1024,
            file_mtime: 1700000000,
        }
    }

    #[test]
    fn weak_key_thresholds() {
        assert!(is_weak_key(1024, "RSA"));
        assert!(!is_weak_key(2048, "RSA"));
        assert!(is_weak_key(160, "ECDSA"));
        assert!(!is_weak_key(256, "ECDSA"));
        assert!(is_weak_key(1024, "DSA"));
        assert!(!is_weak_key(2048, "DSA"));
        // Unknown algorithms are held to the RSA threshold.
        assert!(is_weak_key(1024, "unknown"));
        assert!(!is_weak_key(4096, "unknown"));
    }

    #[test]
    fn deprecated_signature_algorithms() {
        assert!(is_deprecated_signature_algorithm("md5WithRSAEncryption"));
        assert!(is_deprecated_signature_algorithm("sha1WithRSAEncryption"));
        assert!(!is_deprecated_signature_algorithm("sha256WithRSAEncryption"));
        assert!(!is_deprecated_signature_algorithm("sha384WithECDSA"));
    }

    #[test]
    fn issuer_codes() {
        assert_eq!(issuer_code("DigiCert Inc"), 30);
        assert_eq!(issuer_code("Amazon RSA 2048 M02"), 31);
        assert_eq!(issuer_code("AWS Private CA"), 31);
        assert_eq!(issuer_code("self-signed"), 33);
        assert_eq!(issuer_code("localhost"), 33);
        assert_eq!(issuer_code("127.0.0.1"), 33);
        assert_eq!(issuer_code("Let's Encrypt"), 32);
        // DigiCert wins over a mention of Amazon later in the string.
        assert_eq!(issuer_code("DigiCert for Amazon"), 30);
    }

    #[test]
    fn certificate_updates_expose_labeled_series() {
        let metrics = MetricsCollection::new();
        metrics.reset_scan_metrics();
        metrics.update_certificate_metrics(&record("a.example", "1", "/certs/a.pem"));
        metrics.update_scan_metrics("/certs", Duration::from_millis(10), 1, 1, 0);

        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_expiration_timestamp{common_name=\"a.example\""));
        assert!(text.contains("ssl_certs_parsed_total 1"));
        assert!(text.contains("ssl_cert_san_count{common_name=\"a.example\",path=\"/certs/a.pem\"} 1"));
        assert!(text.contains("ssl_cert_files_total{directory=\"/certs\"} 1"));
        assert!(text.contains("ssl_cert_issuer_code{common_name=\"a.example\",issuer=\"Example CA\",path=\"/certs/a.pem\"} 32"));
    }

    #[test]
    fn parsed_total_accumulates_across_directories() {
        let metrics = MetricsCollection::new();
        metrics.reset_scan_metrics();
        metrics.update_scan_metrics("/a", Duration::from_millis(5), 2, 2, 0);
        metrics.update_scan_metrics("/b", Duration::from_millis(5), 3, 3, 0);

        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_certs_parsed_total 5"));
    }

    #[test]
    fn parse_errors_count_and_expose_names() {
        let metrics = MetricsCollection::new();
        metrics.reset_scan_metrics();
        metrics.record_parse_error("invalid.pem", "invalid_certificate", &"x".repeat(200));
        metrics.update_scan_metrics("/certs", Duration::from_millis(5), 1, 0, 1);

        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_parse_errors_total 1"));
        assert!(text.contains("ssl_cert_parse_error_names{filename=\"invalid.pem\""));
        // The message label is truncated to 100 characters.
        assert!(text.contains(&"x".repeat(100)));
        assert!(!text.contains(&"x".repeat(101)));
    }

    #[test]
    fn duplicates_are_counted_by_serial() {
        let metrics = MetricsCollection::new();
        metrics.reset_scan_metrics();
        metrics.update_certificate_metrics(&record("a.example", "12345", "/certs/a.pem"));
        metrics.update_certificate_metrics(&record("b.example", "12345", "/certs/b.pem"));
        metrics.update_certificate_metrics(&record("c.example", "99", "/certs/c.pem"));

        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_duplicate_count 1"));
        assert!(text.contains("ssl_cert_duplicate_names{serial_number=\"12345\""));
        assert!(text.contains("/certs/a.pem,/certs/b.pem"));
    }

    #[test]
    fn reset_zeroes_current_scan_gauges_and_duplicate_index() {
        let metrics = MetricsCollection::new();
        metrics.update_certificate_metrics(&record("a.example", "12345", "/certs/a.pem"));
        metrics.update_certificate_metrics(&record("b.example", "12345", "/certs/b.pem"));
        metrics.record_parse_error("bad.pem", "invalid_certificate", "nope");
        metrics.update_scan_metrics("/certs", Duration::from_millis(5), 3, 2, 1);

        metrics.reset_scan_metrics();
        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_certs_parsed_total 0"));
        assert!(text.contains("ssl_cert_parse_errors_total 0"));
        assert!(text.contains("ssl_cert_weak_key_total 0"));
        assert!(text.contains("ssl_cert_deprecated_sigalg_total 0"));
        assert!(text.contains("ssl_cert_duplicate_count 0"));
    }

    #[test]
    fn clearing_certificate_metrics_retracts_labeled_series() {
        let metrics = MetricsCollection::new();
        metrics.update_certificate_metrics(&record("a.example", "12345", "/certs/a.pem"));
        metrics.update_certificate_metrics(&record("b.example", "12345", "/certs/b.pem"));
        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_expiration_timestamp{"));
        assert!(text.contains("ssl_cert_duplicate_names{"));

        metrics.clear_all_certificate_metrics();
        metrics.reset_scan_metrics();
        let text = metrics.assemble().unwrap();
        assert!(!text.contains("ssl_cert_expiration_timestamp{"));
        assert!(!text.contains("ssl_cert_san_count{"));
        assert!(!text.contains("ssl_cert_info{"));
        assert!(!text.contains("ssl_cert_issuer_code{"));
        assert!(!text.contains("ssl_cert_duplicate_names{"));
    }

    #[test]
    fn reset_parse_error_metrics_drops_error_series() {
        let metrics = MetricsCollection::new();
        metrics.record_parse_error("bad.p12", "pkcs12_password", "no password matched");
        metrics.update_scan_metrics("/certs", Duration::from_millis(5), 1, 0, 1);

        metrics.reset_parse_error_metrics();
        let text = metrics.assemble().unwrap();
        assert!(!text.contains("ssl_cert_parse_error_names{"));
        assert!(text.contains("ssl_cert_parse_errors_total 0"));
    }

    #[test]
    fn weak_and_deprecated_counts_follow_records() {
        let metrics = MetricsCollection::new();
        metrics.reset_scan_metrics();
        let mut weak = record("weak.example", "7", "/certs/weak.pem");
        weak.key_size = 1024;
        weak.is_weak_key = true;
        weak.signature_algorithm = "sha1WithRSAEncryption".to_string();
        weak.is_deprecated_algorithm = true;
        metrics.update_certificate_metrics(&weak);
        metrics.update_scan_metrics("/certs", Duration::from_millis(5), 1, 1, 0);

        let text = metrics.assemble().unwrap();
        assert!(text.contains("ssl_cert_weak_key_total 1"));
        assert!(text.contains("ssl_cert_deprecated_sigalg_total 1"));
    }

    #[test]
    fn numeric_rendering_only_touches_listed_metrics() {
        let text = "\
# TYPE ssl_cert_last_scan_timestamp gauge
ssl_cert_last_scan_timestamp{directory=\"/certs\"} 1.7540928e+09
ssl_cert_san_count{common_name=\"a\",path=\"/p\"} 3.0
app_cpu_percent 2.5
ssl_cert_scan_duration_seconds_sum{directory=\"/certs\"} 0.25
app_memory_bytes{type=\"rss\"} 5.24288e+07
";
        let formatted = format_numeric_values(text);
        assert!(formatted.contains("ssl_cert_last_scan_timestamp{directory=\"/certs\"} 1754092800"));
        assert!(formatted.contains("ssl_cert_san_count{common_name=\"a\",path=\"/p\"} 3"));
        assert!(formatted.contains("app_memory_bytes{type=\"rss\"} 52428800"));
        // Non-listed metrics and non-integral values are untouched.
        assert!(formatted.contains("app_cpu_percent 2.5"));
        assert!(formatted.contains("ssl_cert_scan_duration_seconds_sum{directory=\"/certs\"} 0.25"));
    }

    #[test]
    fn exposition_uses_the_prometheus_content_type() {
        assert_eq!(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8");
    }
}
