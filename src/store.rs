use std::fs;
use std::io::{Read, Write};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::Builder;
use tracing::{debug, info};

use crate::domain::CountryCode;
use crate::error::VaultError;
use crate::transform::BoundaryRow;

pub const SOURCE: &str = "overpass";
pub const BACKUP_FORMAT: u32 = 2;

static BACKUP_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]{2})_L([0-9]+)\.json(\.gz)?$").expect("valid regex")
});

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), VaultError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))
    }

    fn stem(country: &CountryCode, level: u32) -> String {
        format!("{}_L{level}", country.as_str())
    }

    pub fn backup_path(&self, country: &CountryCode, level: u32) -> Utf8PathBuf {
        self.root.join(format!("{}.json", Self::stem(country, level)))
    }

    pub fn raw_path(&self, country: &CountryCode, level: u32) -> Utf8PathBuf {
        self.root.join(format!("{}.raw.json", Self::stem(country, level)))
    }

    pub fn raw_part_path(&self, country: &CountryCode, level: u32, part: usize) -> Utf8PathBuf {
        self.root
            .join(format!("{}.raw.part{part}.json", Self::stem(country, level)))
    }

    pub fn countries_path(&self) -> Utf8PathBuf {
        self.root.join("countries.json")
    }

    pub fn countries_raw_path(&self) -> Utf8PathBuf {
        self.root.join("countries.raw.json")
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.root.join("country-levels.json")
    }

    pub fn backup_exists(&self, country: &CountryCode, level: u32) -> bool {
        let path = self.backup_path(country, level);
        path.as_std_path().exists() || gz_path(&path).as_std_path().exists()
    }

    /// Removes raw side-car files of one target that are not listed in `keep`.
    pub fn prune_raw_sidecars(
        &self,
        country: &CountryCode,
        level: u32,
        keep: &[String],
    ) -> Result<Vec<String>, VaultError> {
        let prefix = format!("{}.raw.", Self::stem(country, level));
        let mut removed = Vec::new();
        if !self.root.as_std_path().exists() {
            return Ok(removed);
        }
        let dir = fs::read_dir(self.root.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        for entry in dir {
            let entry = entry.map_err(|err| VaultError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") || keep.contains(&name) {
                continue;
            }
            fs::remove_file(entry.path())
                .map_err(|err| VaultError::Filesystem(format!("remove {name}: {err}")))?;
            removed.push(name);
        }
        removed.sort();
        Ok(removed)
    }
}

pub fn gz_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.gz"))
}

pub fn file_name(path: &Utf8Path) -> String {
    path.file_name().unwrap_or(path.as_str()).to_string()
}

pub trait Timestamped: Serialize {
    fn stamp(&mut self, created_at: String, refreshed_at: String);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawReference {
    File(String),
    Parts(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub created_at: String,
    pub refreshed_at: String,
    pub country_code: CountryCode,
    pub level: u32,
    pub source: String,
    pub format: u32,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub meta: BackupMeta,
    pub rows: Vec<BoundaryRow>,
    #[serde(default)]
    pub raw_api_response_file: Option<RawReference>,
}

impl BackupRecord {
    pub fn new(
        country: CountryCode,
        level: u32,
        endpoint: String,
        rows: Vec<BoundaryRow>,
        raw_api_response_file: Option<RawReference>,
    ) -> Self {
        Self {
            meta: BackupMeta {
                created_at: String::new(),
                refreshed_at: String::new(),
                country_code: country,
                level,
                source: SOURCE.to_string(),
                format: BACKUP_FORMAT,
                endpoint,
            },
            rows,
            raw_api_response_file,
        }
    }
}

impl RawReference {
    pub fn files(&self) -> Vec<String> {
        match self {
            RawReference::File(name) => vec![name.clone()],
            RawReference::Parts(names) => names.clone(),
        }
    }
}

impl Timestamped for BackupRecord {
    fn stamp(&mut self, created_at: String, refreshed_at: String) {
        self.meta.created_at = created_at;
        self.meta.refreshed_at = refreshed_at;
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), VaultError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| VaultError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".boundary-vault")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| VaultError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| VaultError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| VaultError::Filesystem(format!("persist {path}: {err}")))?;
    Ok(())
}

pub fn gzip(content: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content)
        .map_err(|err| VaultError::Filesystem(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| VaultError::Filesystem(err.to_string()))
}

pub fn gunzip(content: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut decoder = GzDecoder::new(content);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| VaultError::Filesystem(err.to_string()))?;
    Ok(out)
}

pub fn read_artifact(path: &Utf8Path) -> Result<Option<Vec<u8>>, VaultError> {
    if path.as_std_path().exists() {
        let bytes = fs::read(path.as_std_path())
            .map_err(|err| VaultError::Filesystem(format!("read {path}: {err}")))?;
        return Ok(Some(bytes));
    }
    let compressed = gz_path(path);
    if compressed.as_std_path().exists() {
        let bytes = fs::read(compressed.as_std_path())
            .map_err(|err| VaultError::Filesystem(format!("read {compressed}: {err}")))?;
        return gunzip(&bytes).map(Some);
    }
    Ok(None)
}

pub fn existing_created_at(path: &Utf8Path) -> Option<String> {
    let bytes = read_artifact(path).ok().flatten()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    let created_at = value.get("meta")?.get("created_at")?.as_str()?;
    DateTime::parse_from_rfc3339(created_at).ok()?;
    Some(created_at.to_string())
}

pub fn serialize_record<R: Serialize>(record: &R) -> Result<Vec<u8>, VaultError> {
    serde_json::to_vec_pretty(record).map_err(|err| VaultError::Filesystem(err.to_string()))
}

/// Writes `record` to `path` (or `path.gz` when `compress`), keeping the
/// `created_at` of any record already stored there. Returns the final
/// artifact path.
pub fn write_record<R: Timestamped>(
    path: &Utf8Path,
    record: &mut R,
    fallback_created_at: &str,
    compress: bool,
) -> Result<Utf8PathBuf, VaultError> {
    let created_at =
        existing_created_at(path).unwrap_or_else(|| fallback_created_at.to_string());
    record.stamp(created_at, now_timestamp());
    let content = serialize_record(record)?;

    write_bytes_atomic(path, &content)?;
    if !compress {
        let stale = gz_path(path);
        if stale.as_std_path().exists() {
            fs::remove_file(stale.as_std_path())
                .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        }
        debug!(path = %path, bytes = content.len(), "record written");
        return Ok(path.to_path_buf());
    }

    let compressed = gz_path(path);
    write_bytes_atomic(&compressed, &gzip(&content)?)?;
    fs::remove_file(path.as_std_path())
        .map_err(|err| VaultError::Filesystem(format!("remove {path}: {err}")))?;
    debug!(path = %compressed, bytes = content.len(), "record written compressed");
    Ok(compressed)
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub country_code: String,
    pub level: u32,
    pub file: String,
    pub compressed: bool,
    pub rows: Option<usize>,
    pub size_bytes: u64,
    pub modified_at: Option<String>,
}

pub fn list_backups(layout: &Layout) -> Result<Vec<BackupEntry>, VaultError> {
    let root = layout.root();
    if !root.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    let dir = fs::read_dir(root.as_std_path())
        .map_err(|err| VaultError::Filesystem(err.to_string()))?;
    for entry in dir {
        let entry = entry.map_err(|err| VaultError::Filesystem(err.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(caps) = BACKUP_FILE.captures(&name) else {
            continue;
        };
        let Ok(level) = caps[2].parse::<u32>() else {
            continue;
        };
        let metadata = entry
            .metadata()
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        let bytes = fs::read(entry.path()).map_err(|err| VaultError::Filesystem(err.to_string()))?;
        let compressed = caps.get(3).is_some();
        let content = if compressed {
            gunzip(&bytes).ok()
        } else {
            Some(bytes)
        };
        let rows = content
            .and_then(|content| serde_json::from_slice::<Value>(&content).ok())
            .and_then(|value| value.get("rows").and_then(|rows| rows.as_array()).map(Vec::len));
        let modified_at = metadata
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true));
        entries.push(BackupEntry {
            country_code: caps[1].to_string(),
            level,
            file: name,
            compressed,
            rows,
            size_bytes: metadata.len(),
            modified_at,
        });
    }
    entries.sort_by(|a, b| {
        (a.country_code.as_str(), a.level, a.compressed).cmp(&(
            b.country_code.as_str(),
            b.level,
            b.compressed,
        ))
    });
    info!(root = %root, count = entries.len(), "listed backups");
    Ok(entries)
}

pub fn read_backup(layout: &Layout, country: &CountryCode, level: u32) -> Result<Value, VaultError> {
    let path = layout.backup_path(country, level);
    let bytes = read_artifact(&path)?
        .ok_or_else(|| VaultError::BackupNotFound(format!("{country} level {level}")))?;
    serde_json::from_slice(&bytes).map_err(|err| VaultError::CorruptRecord {
        path: path.to_string(),
        message: err.to_string(),
    })
}
