use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::CountryCode;
use crate::error::VaultError;
use crate::store::{SOURCE, Timestamped, read_artifact, write_record};

pub const CATALOG_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMeta {
    pub created_at: String,
    pub refreshed_at: String,
    pub source: String,
    pub format: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub meta: CatalogMeta,
    pub levels_by_country: BTreeMap<String, Vec<u32>>,
}

impl Timestamped for CatalogRecord {
    fn stamp(&mut self, created_at: String, refreshed_at: String) {
        self.meta.created_at = created_at;
        self.meta.refreshed_at = refreshed_at;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LevelCatalog {
    levels: BTreeMap<CountryCode, Vec<u32>>,
    changed: bool,
}

impl LevelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Utf8Path) -> Self {
        let bytes = match read_artifact(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Self::new(),
            Err(err) => {
                warn!(path = %path, "ignoring unreadable level catalog: {err}");
                return Self::new();
            }
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path, "ignoring corrupt level catalog: {err}");
                return Self::new();
            }
        };
        let Some(entries) = value
            .get("levels_by_country")
            .and_then(|entries| entries.as_object())
        else {
            return Self::new();
        };

        let mut levels = BTreeMap::new();
        for (key, list) in entries {
            let Ok(country) = key.parse::<CountryCode>() else {
                continue;
            };
            if country.as_str() != key {
                continue;
            }
            if let Some(list) = valid_levels(list) {
                levels.insert(country, list);
            }
        }
        info!(path = %path, countries = levels.len(), "loaded level catalog");
        Self {
            levels,
            changed: false,
        }
    }

    pub fn get(&self, country: &CountryCode) -> Option<&[u32]> {
        self.levels.get(country).map(Vec::as_slice)
    }

    pub fn record(&mut self, country: CountryCode, mut levels: Vec<u32>) {
        levels.sort_unstable();
        levels.dedup();
        if self.levels.get(&country) != Some(&levels) {
            self.levels.insert(country, levels);
            self.changed = true;
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn save(&mut self, path: &Utf8Path, fallback_created_at: &str) -> Result<(), VaultError> {
        let mut record = CatalogRecord {
            meta: CatalogMeta {
                created_at: String::new(),
                refreshed_at: String::new(),
                source: SOURCE.to_string(),
                format: CATALOG_FORMAT,
            },
            levels_by_country: self
                .levels
                .iter()
                .map(|(country, levels)| (country.to_string(), levels.clone()))
                .collect(),
        };
        write_record(path, &mut record, fallback_created_at, false)?;
        self.changed = false;
        info!(path = %path, countries = self.levels.len(), "saved level catalog");
        Ok(())
    }
}

fn valid_levels(list: &Value) -> Option<Vec<u32>> {
    let items = list.as_array()?;
    let mut levels = Vec::with_capacity(items.len());
    for item in items {
        let level = item.as_u64().filter(|level| *level > 0)?;
        levels.push(u32::try_from(level).ok()?);
    }
    if levels.windows(2).any(|pair| pair[0] >= pair[1]) {
        return None;
    }
    Some(levels)
}
