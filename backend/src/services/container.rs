//! Backup container format.
//!
//! A container is an uncompressed tar holding `manifest.json`,
//! `database.dump` and `checksums.json`, encrypted as a whole by
//! [`ContainerCipher`](crate::services::encryption::ContainerCipher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::backup::ChecksumTable;

/// Version of the container layout.
pub const CONTAINER_FORMAT_VERSION: u32 = 1;

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const DUMP_ENTRY: &str = "database.dump";
pub const CHECKSUMS_ENTRY: &str = "checksums.json";

/// Extension of encrypted containers.
pub const CONTAINER_EXTENSION: &str = "tar.enc";

const CHECKSUM_ALGORITHM: &str = "sha256";
const MAX_LABEL_LEN: usize = 48;

/// Self-describing header stored inside every container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerManifest {
    pub format_version: u32,
    pub app_version: String,
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
    pub includes_files: bool,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Free-text summary of scope and label
    #[serde(default)]
    pub notes: String,
}

impl ContainerManifest {
    pub fn new(
        schema_version: i64,
        includes_files: bool,
        scope: Vec<String>,
        label: Option<String>,
    ) -> Self {
        let notes = format!(
            "scope={}{}",
            scope_token(&scope),
            label
                .as_deref()
                .map(|l| format!("; label={}", l))
                .unwrap_or_default()
        );
        Self {
            format_version: CONTAINER_FORMAT_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version,
            created_at: Utc::now(),
            includes_files,
            scope,
            label,
            notes,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let manifest: Self = serde_json::from_slice(&bytes)?;
        if manifest.format_version != CONTAINER_FORMAT_VERSION {
            return Err(AppError::Validation(format!(
                "unsupported container format version {} (expected {})",
                manifest.format_version, CONTAINER_FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }
}

/// Paths of the members of an unpacked container.
#[derive(Debug, Clone)]
pub struct UnpackedContainer {
    pub manifest_path: PathBuf,
    pub dump_path: PathBuf,
    pub checksums_path: Option<PathBuf>,
}

impl UnpackedContainer {
    /// Checksum table embedded in the container, if present.
    pub fn embedded_checksums(&self) -> Result<Option<ChecksumTable>> {
        match &self.checksums_path {
            Some(path) => Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?)),
            None => Ok(None),
        }
    }
}

/// One member whose recomputed digest differs from the recorded one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub member: String,
    pub expected: String,
    pub actual: String,
}

/// Hex SHA-256 of a byte slice.
pub fn bytes_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of a file, streamed.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn entry_header(size: u64, mtime: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o600);
    header.set_mtime(mtime);
    header.set_cksum();
    header
}

/// Pack the manifest and dump into an uncompressed tar at `out_path`.
///
/// Returns the checksum table: per-member digests plus the digest of the
/// finished archive.
pub fn pack_archive(
    manifest: &ContainerManifest,
    dump_path: &Path,
    out_path: &Path,
) -> Result<ChecksumTable> {
    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    let mut table = ChecksumTable {
        algorithm: CHECKSUM_ALGORITHM.to_string(),
        manifest: bytes_sha256(&manifest_bytes),
        dump: file_sha256(dump_path)?,
        archive: None,
    };
    // The embedded copy cannot describe the archive it lives in.
    let table_bytes = serde_json::to_vec_pretty(&table)?;
    let mtime = manifest.created_at.timestamp().max(0) as u64;

    let file = File::create(out_path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let mut header = entry_header(manifest_bytes.len() as u64, mtime);
    builder.append_data(&mut header, MANIFEST_ENTRY, manifest_bytes.as_slice())?;

    let dump = File::open(dump_path)?;
    let dump_len = dump.metadata()?.len();
    let mut header = entry_header(dump_len, mtime);
    builder.append_data(&mut header, DUMP_ENTRY, BufReader::new(dump))?;

    let mut header = entry_header(table_bytes.len() as u64, mtime);
    builder.append_data(&mut header, CHECKSUMS_ENTRY, table_bytes.as_slice())?;

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    table.archive = Some(file_sha256(out_path)?);
    Ok(table)
}

/// Extract the known members of `archive_path` into `dest_dir`.
pub fn unpack_archive(archive_path: &Path, dest_dir: &Path) -> Result<UnpackedContainer> {
    let corrupt = |e: io::Error| AppError::Checksum(format!("archive is unreadable: {}", e));

    let mut archive = tar::Archive::new(BufReader::new(File::open(archive_path)?));
    let mut manifest_path = None;
    let mut dump_path = None;
    let mut checksums_path = None;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            return Err(AppError::Checksum("archive member is not a regular file".into()));
        }
        let name = entry.path().map_err(corrupt)?.to_string_lossy().to_string();
        let slot = match name.as_str() {
            MANIFEST_ENTRY => &mut manifest_path,
            DUMP_ENTRY => &mut dump_path,
            CHECKSUMS_ENTRY => &mut checksums_path,
            other => {
                return Err(AppError::Checksum(format!(
                    "unexpected archive member '{}'",
                    other
                )))
            }
        };
        let target = dest_dir.join(&name);
        entry.unpack(&target).map_err(corrupt)?;
        *slot = Some(target);
    }

    Ok(UnpackedContainer {
        manifest_path: manifest_path
            .ok_or_else(|| AppError::Checksum(format!("archive has no {}", MANIFEST_ENTRY)))?,
        dump_path: dump_path
            .ok_or_else(|| AppError::Checksum(format!("archive has no {}", DUMP_ENTRY)))?,
        checksums_path,
    })
}

/// Recompute digests and compare them against `expected`.
pub fn verify_checksums(
    archive_path: &Path,
    unpacked: &UnpackedContainer,
    expected: &ChecksumTable,
) -> Result<Vec<ChecksumMismatch>> {
    if expected.algorithm != CHECKSUM_ALGORITHM {
        return Err(AppError::Checksum(format!(
            "unsupported checksum algorithm '{}'",
            expected.algorithm
        )));
    }

    let mut mismatches = Vec::new();
    let mut compare = |member: &str, expected: &str, actual: String| {
        if !expected.eq_ignore_ascii_case(&actual) {
            mismatches.push(ChecksumMismatch {
                member: member.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    };

    if let Some(archive) = &expected.archive {
        compare("archive", archive, file_sha256(archive_path)?);
    }
    compare(MANIFEST_ENTRY, &expected.manifest, file_sha256(&unpacked.manifest_path)?);
    compare(DUMP_ENTRY, &expected.dump, file_sha256(&unpacked.dump_path)?);

    Ok(mismatches)
}

/// Lower-case, de-duplicated, sorted scope. `all` or an empty list means everything.
pub fn normalize_scope(scope: &[String]) -> Vec<String> {
    let mut domains: Vec<String> = scope
        .iter()
        .map(|s| sanitize_token(s).to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if domains.iter().any(|d| d == "all") {
        return Vec::new();
    }
    domains.sort();
    domains.dedup();
    domains
}

/// `DOCS-INCIDENTS` for a normalized scope, `ALL` for an empty one.
pub fn scope_token(scope: &[String]) -> String {
    if scope.is_empty() {
        "ALL".to_string()
    } else {
        scope
            .iter()
            .map(|s| s.to_uppercase())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Upper-case `[A-Z0-9-]` token, or `None` if nothing usable remains.
pub fn sanitize_label(label: &str) -> Option<String> {
    let token: String = sanitize_token(label).to_uppercase().chars().take(MAX_LABEL_LEN).collect();
    let token = token.trim_matches('-').to_string();
    (!token.is_empty()).then_some(token)
}

fn sanitize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// `backup_<SCOPE>_[<LABEL>_]<TIMESTAMP>.tar.enc`
pub fn container_filename(scope: &[String], label: Option<&str>, at: DateTime<Utc>) -> String {
    let mut name = format!("backup_{}_", scope_token(&normalize_scope(scope)));
    if let Some(label) = label.and_then(sanitize_label) {
        name.push_str(&label);
        name.push('_');
    }
    name.push_str(&at.format("%Y%m%dT%H%M%SZ").to_string());
    name.push('.');
    name.push_str(CONTAINER_EXTENSION);
    name
}
