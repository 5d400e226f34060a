//! Certificate parsing and attribute extraction.
//!
//! Files are parsed from PEM, DER or PKCS#12 into a fixed
//! [`CertificateRecord`]; the metrics registry consumes fields by name and
//! the cache serializes records deterministically.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use x509_parser::oid_registry::{Oid, OidRegistry};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::metrics::{is_deprecated_signature_algorithm, is_weak_key};

//------------ CertificateRecord ---------------------------------------------

/// Everything the monitor derives from one certificate file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub common_name: String,
    pub issuer: String,
    pub subject: String,
    pub serial: String,
    pub not_before: Timestamp,
    pub not_after: Timestamp,
    pub expiration_timestamp: i64,
    pub days_until_expiry: i64,
    pub key_size: u32,
    pub key_algorithm: String,
    pub signature_algorithm: String,
    pub san_list: Vec<String>,
    pub san_count: usize,
    pub is_weak_key: bool,
    pub is_deprecated_algorithm: bool,
    pub version: u32,
    pub path: Utf8PathBuf,
    pub filename: String,
    pub file_size: u64,
    pub file_mtime: i64,
}

//------------ ParseError ----------------------------------------------------

/// A certificate file could not be turned into a record.
#[derive(Debug)]
pub enum ParseError {
    /// The file could not be read.
    Io(io::Error),

    /// The contents parse as neither PEM nor DER.
    InvalidCertificate(String),

    /// The PKCS#12 structure is malformed.
    Pkcs12(String),

    /// No configured password decrypts the PKCS#12 file.
    Pkcs12Password,
}

impl ParseError {
    /// A short classifier for the `error_type` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::InvalidCertificate(_) => "invalid_certificate",
            Self::Pkcs12(_) => "pkcs12_error",
            Self::Pkcs12Password => "pkcs12_password",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "could not read file: {err}"),
            Self::InvalidCertificate(err) => f.write_str(err),
            Self::Pkcs12(err) => write!(f, "malformed PKCS#12 file: {err}"),
            Self::Pkcs12Password => {
                f.write_str("Could not decrypt PKCS#12 file with any provided password")
            }
        }
    }
}

impl std::error::Error for ParseError {}

//------------ Parsing -------------------------------------------------------

/// Parse one certificate file into a record.
///
/// `.p12`/`.pfx` files go through PKCS#12 decryption with the configured
/// password list; everything else is tried as PEM, then as DER.
pub fn parse_certificate_file(
    path: &Utf8Path,
    p12_passwords: &[String],
) -> Result<CertificateRecord, ParseError> {
    let data = std::fs::read(path).map_err(ParseError::Io)?;

    let ext = path
        .extension()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let info = if ext == "p12" || ext == "pfx" {
        parse_pkcs12(&data, p12_passwords)?
    } else {
        parse_pem_der(&data)?
    };

    let meta = std::fs::metadata(path).map_err(ParseError::Io)?;
    let mtime = file_mtime(&meta);

    Ok(info.into_record(path, meta.len(), mtime))
}

/// A file's modification time in whole seconds since the Unix epoch.
pub fn file_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse PEM (first CERTIFICATE block) or, failing that, DER.
fn parse_pem_der(data: &[u8]) -> Result<CertInfo, ParseError> {
    for pem in Pem::iter_from_buffer(data).flatten() {
        if pem.label == "CERTIFICATE" {
            let cert = pem
                .parse_x509()
                .map_err(|err| ParseError::InvalidCertificate(err.to_string()))?;
            return Ok(extract(&cert));
        }
    }

    // The DER error is the reported cause when both fail.
    match X509Certificate::from_der(data) {
        Ok((_, cert)) => Ok(extract(&cert)),
        Err(err) => Err(ParseError::InvalidCertificate(format!(
            "could not parse as PEM or DER: {err}"
        ))),
    }
}

/// Decrypt a PKCS#12 bundle and extract its certificate.
///
/// Every configured password is attempted even after one succeeds, so that
/// the trial's duration does not reveal which password matched. The first
/// successful certificate is retained.
fn parse_pkcs12(data: &[u8], passwords: &[String]) -> Result<CertInfo, ParseError> {
    let pkcs12 = openssl::pkcs12::Pkcs12::from_der(data)
        .map_err(|err| ParseError::Pkcs12(err.to_string()))?;

    let mut successful: Option<Vec<u8>> = None;
    for password in passwords {
        if let Ok(parsed) = pkcs12.parse2(password) {
            if let Some(cert) = parsed.cert {
                if successful.is_none() {
                    successful = cert.to_der().ok();
                }
            }
        }
    }

    let der = successful.ok_or(ParseError::Pkcs12Password)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|err| ParseError::Pkcs12(err.to_string()))?;
    Ok(extract(&cert))
}

//------------ Extraction ----------------------------------------------------

/// The certificate-derived part of a record, before file metadata is added.
struct CertInfo {
    common_name: String,
    issuer: String,
    subject: String,
    serial: String,
    not_before: i64,
    not_after: i64,
    key_size: u32,
    key_algorithm: String,
    signature_algorithm: String,
    san_list: Vec<String>,
    version: u32,
}

impl CertInfo {
    fn into_record(self, path: &Utf8Path, file_size: u64, file_mtime: i64) -> CertificateRecord {
        let now = Timestamp::now().as_second();
        let san_count = self.san_list.len();
        CertificateRecord {
            is_weak_key: is_weak_key(self.key_size, &self.key_algorithm),
            is_deprecated_algorithm: is_deprecated_signature_algorithm(&self.signature_algorithm),
            common_name: self.common_name,
            issuer: self.issuer,
            subject: self.subject,
            serial: self.serial,
            not_before: Timestamp::from_second(self.not_before).unwrap_or(Timestamp::UNIX_EPOCH),
            not_after: Timestamp::from_second(self.not_after).unwrap_or(Timestamp::UNIX_EPOCH),
            expiration_timestamp: self.not_after,
            days_until_expiry: (self.not_after - now).div_euclid(86400),
            key_size: self.key_size,
            key_algorithm: self.key_algorithm,
            signature_algorithm: self.signature_algorithm,
            san_list: self.san_list,
            san_count,
            version: self.version,
            path: path.to_owned(),
            filename: path.file_name().unwrap_or_default().to_string(),
            file_size,
            file_mtime,
        }
    }
}

fn extract(cert: &X509Certificate) -> CertInfo {
    let common_name =
        first_attr(cert.subject().iter_common_name()).unwrap_or_else(|| "unknown".into());

    // Issuer CN, falling back to the issuer organization.
    let issuer = first_attr(cert.issuer().iter_common_name())
        .or_else(|| first_attr(cert.issuer().iter_organization()))
        .unwrap_or_else(|| "unknown".into());

    let (key_algorithm, key_size) = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => ("RSA".to_string(), int_bits(rsa.modulus)),
        Ok(PublicKey::EC(point)) => ("ECDSA".to_string(), ec_key_size(point.data())),
        Ok(PublicKey::DSA(y)) => ("DSA".to_string(), int_bits(y)),
        Ok(_) | Err(_) => ("unknown".to_string(), 0),
    };

    CertInfo {
        common_name,
        issuer,
        subject: cert.subject().to_string(),
        serial: cert.tbs_certificate.serial.to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        key_size,
        key_algorithm,
        signature_algorithm: signature_algorithm_name(&cert.signature_algorithm.algorithm),
        san_list: san_list(cert),
        version: cert.tbs_certificate.version.0,
    }
}

fn first_attr<'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn san_list(cert: &X509Certificate) -> Vec<String> {
    let Ok(Some(ext)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    ext.value
        .general_names
        .iter()
        .map(format_general_name)
        .collect()
}

fn format_general_name(name: &GeneralName) -> String {
    match name {
        GeneralName::DNSName(name) => format!("DNS:{name}"),
        GeneralName::RFC822Name(addr) => format!("email:{addr}"),
        GeneralName::URI(uri) => format!("URI:{uri}"),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => {
                let octets: [u8; 4] = (*bytes).try_into().expect("length checked");
                format!("IP:{}", Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = (*bytes).try_into().expect("length checked");
                format!("IP:{}", Ipv6Addr::from(octets))
            }
            _ => format!("IP:{bytes:02x?}"),
        },
        GeneralName::DirectoryName(name) => format!("DirName:{name}"),
        other => format!("{other:?}"),
    }
}

/// The conventional name of a signature-algorithm OID, or its dotted form
/// when unknown.
fn signature_algorithm_name(oid: &Oid) -> String {
    static REGISTRY: LazyLock<OidRegistry<'static>> =
        LazyLock::new(|| OidRegistry::default().with_all_crypto().with_x509());
    REGISTRY
        .get(oid)
        .map(|entry| entry.sn().to_string())
        .unwrap_or_else(|| oid.to_id_string())
}

/// The bit length of a big-endian unsigned integer, ignoring leading zero
/// bytes.
fn int_bits(bytes: &[u8]) -> u32 {
    (bytes.iter().skip_while(|b| **b == 0).count() * 8) as u32
}

/// The field size of an EC public key point.
fn ec_key_size(point: &[u8]) -> u32 {
    match point.first() {
        // Uncompressed or hybrid: one tag byte plus two coordinates.
        Some(0x04) | Some(0x06) | Some(0x07) => (((point.len() - 1) / 2) * 8) as u32,
        // Compressed: one tag byte plus one coordinate.
        Some(0x02) | Some(0x03) => ((point.len() - 1) * 8) as u32,
        _ => 0,
    }
}

//------------ Test support --------------------------------------------------
