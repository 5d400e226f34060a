//! Types exchanged over the HTTP surface.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cert::CertificateRecord;

//------------ Scan results --------------------------------------------------

/// The result of one full scan, as returned by `/scan`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub summary: ScanSummary,
    pub directories: Vec<DirectoryScan>,
    /// Scan start, fractional seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Aggregate counters across all scanned directories.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_duration: f64,
    pub total_files: usize,
    pub total_parsed: usize,
    pub total_errors: usize,
    pub directories_scanned: usize,
}

/// The scan result of a single directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryScan {
    pub directory: Utf8PathBuf,
    pub files_processed: usize,
    pub certificates_parsed: usize,
    pub parse_errors: usize,
    pub certificates: Vec<CertificateRecord>,
    pub disk_usage: DiskUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectoryScan {
    /// The entry reported for a directory that could not be scanned at all.
    pub fn failed(directory: Utf8PathBuf, error: String) -> Self {
        Self {
            directory,
            files_processed: 0,
            certificates_parsed: 0,
            parse_errors: 1,
            certificates: Vec::new(),
            disk_usage: DiskUsage::default(),
            error: Some(error),
        }
    }
}

/// Disk usage of the filesystem a directory lives on.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

//------------ Scanner health ------------------------------------------------

/// The scanner fragment of the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ScannerHealth {
    pub cert_scan_status: ScanStatus,
    pub certificate_directories: Vec<Utf8PathBuf>,
    pub worker_pool_size: usize,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Stopped,
}
