use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::CountryCode;
use crate::overpass::elements;
use crate::store::{RawReference, SOURCE, Timestamped, read_artifact};

pub const COUNTRIES_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryEntry {
    pub country_code: CountryCode,
    pub name: Option<String>,
    pub name_en: Option<String>,
    pub int_name: Option<String>,
    pub official_name: Option<String>,
    pub tags: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountriesMeta {
    pub created_at: String,
    pub refreshed_at: String,
    pub source: String,
    pub format: u32,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountriesRecord {
    pub meta: CountriesMeta,
    pub countries: Vec<CountryEntry>,
    #[serde(default)]
    pub raw_api_response_file: Option<RawReference>,
}

impl CountriesRecord {
    pub fn new(
        endpoint: String,
        countries: Vec<CountryEntry>,
        raw_api_response_file: Option<RawReference>,
    ) -> Self {
        Self {
            meta: CountriesMeta {
                created_at: String::new(),
                refreshed_at: String::new(),
                source: SOURCE.to_string(),
                format: COUNTRIES_FORMAT,
                endpoint,
            },
            countries,
            raw_api_response_file,
        }
    }
}

impl Timestamped for CountriesRecord {
    fn stamp(&mut self, created_at: String, refreshed_at: String) {
        self.meta.created_at = created_at;
        self.meta.refreshed_at = refreshed_at;
    }
}

pub fn parse_countries(payload: &Value) -> Vec<CountryEntry> {
    let mut by_code = BTreeMap::new();
    for element in elements(payload) {
        let Some(tags) = element.get("tags").and_then(|tags| tags.as_object()) else {
            continue;
        };
        let tag = |key: &str| {
            tags.get(key)
                .and_then(|value| value.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let Some(code) = tag("ISO3166-1")
            .or_else(|| tag("ISO3166-1:alpha2"))
            .and_then(|code| code.parse::<CountryCode>().ok())
        else {
            continue;
        };
        by_code.entry(code.clone()).or_insert_with(|| CountryEntry {
            country_code: code,
            name: tag("name"),
            name_en: tag("name:en"),
            int_name: tag("int_name"),
            official_name: tag("official_name"),
            tags: tags.clone(),
        });
    }
    by_code.into_values().collect()
}

pub fn load_country_codes(path: &Utf8Path) -> Option<Vec<CountryCode>> {
    let bytes = match read_artifact(path) {
        Ok(bytes) => bytes?,
        Err(err) => {
            warn!(path = %path, "ignoring unreadable countries file: {err}");
            return None;
        }
    };
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|err| warn!(path = %path, "ignoring corrupt countries file: {err}"))
        .ok()?;
    let mut codes = value
        .get("countries")?
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("country_code")?.as_str())
        .filter(|code| CountryCode::is_valid(code))
        .filter_map(|code| code.parse::<CountryCode>().ok())
        .collect::<Vec<_>>();
    codes.sort();
    codes.dedup();
    (!codes.is_empty()).then_some(codes)
}
