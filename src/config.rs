use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{CountryCode, parse_level};
use crate::error::VaultError;
use crate::overpass::{DEFAULT_ENDPOINTS, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "boundary-vault.json";
pub const ENDPOINTS_ENV: &str = "BOUNDARY_VAULT_ENDPOINTS";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub countries: Option<Selection<String>>,
    #[serde(default)]
    pub levels: Option<Selection<u32>>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub retain_raw: Option<bool>,
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub missing_only: Option<bool>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Selection<T> {
    Keyword(String),
    List(Vec<T>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets<T> {
    All,
    Only(Vec<T>),
}

impl Config {
    pub fn merge(self, overrides: Config) -> Config {
        Config {
            countries: overrides.countries.or(self.countries),
            levels: overrides.levels.or(self.levels),
            output_dir: overrides.output_dir.or(self.output_dir),
            delay_ms: overrides.delay_ms.or(self.delay_ms),
            retain_raw: overrides.retain_raw.or(self.retain_raw),
            compress: overrides.compress.or(self.compress),
            missing_only: overrides.missing_only.or(self.missing_only),
            endpoints: if overrides.endpoints.is_empty() {
                self.endpoints
            } else {
                overrides.endpoints
            },
            timeout_secs: overrides.timeout_secs.or(self.timeout_secs),
            max_attempts: overrides.max_attempts.or(self.max_attempts),
            base_delay_ms: overrides.base_delay_ms.or(self.base_delay_ms),
        }
    }
}

impl<T> Targets<T> {
    pub fn is_all(&self) -> bool {
        matches!(self, Targets::All)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub countries: Targets<CountryCode>,
    pub levels: Targets<u32>,
    pub output_dir: Utf8PathBuf,
    pub delay: Duration,
    pub retain_raw: bool,
    pub compress: bool,
    pub missing_only: bool,
    pub endpoints: Vec<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    pub fn is_full_sweep(&self) -> bool {
        self.missing_only && self.countries.is_all() && self.levels.is_all()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: Option<&str>) -> Result<Config, VaultError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&config_path)
            .map_err(|_| VaultError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| VaultError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&str>, overrides: Config) -> Result<ResolvedConfig, VaultError> {
        let mut config = Self::load(path)?;
        Self::apply_env(&mut config);
        Self::resolve_config(config.merge(overrides))
    }

    pub fn apply_env(config: &mut Config) {
        if let Ok(value) = std::env::var(ENDPOINTS_ENV) {
            let endpoints = split_list(&value);
            if !endpoints.is_empty() {
                config.endpoints = endpoints;
            }
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, VaultError> {
        let countries = match config.countries {
            None => return Err(VaultError::MissingCountries),
            Some(selection) => resolve_countries(selection)?,
        };
        let levels = match config.levels {
            None => return Err(VaultError::MissingLevels),
            Some(selection) => resolve_levels(selection)?,
        };
        if matches!(&countries, Targets::Only(list) if list.is_empty()) {
            return Err(VaultError::MissingCountries);
        }
        if matches!(&levels, Targets::Only(list) if list.is_empty()) {
            return Err(VaultError::MissingLevels);
        }

        let endpoints = if config.endpoints.is_empty() {
            DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect()
        } else {
            config.endpoints
        };
        if endpoints.len() < 2 {
            return Err(VaultError::TooFewEndpoints(endpoints.len()));
        }

        let missing_only = config
            .missing_only
            .unwrap_or(countries.is_all() && levels.is_all());
        let defaults = RetryPolicy::default();
        Ok(ResolvedConfig {
            countries,
            levels,
            output_dir: Utf8PathBuf::from(config.output_dir.unwrap_or_else(|| "backups".to_string())),
            delay: Duration::from_millis(config.delay_ms.unwrap_or(1000)),
            retain_raw: config.retain_raw.unwrap_or(false),
            compress: config.compress.unwrap_or(true),
            missing_only,
            endpoints,
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(180)),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts).max(1),
                base_delay_ms: config.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            },
        })
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_all(keyword: &str) -> bool {
    keyword.trim().eq_ignore_ascii_case("all")
}

fn resolve_countries(selection: Selection<String>) -> Result<Targets<CountryCode>, VaultError> {
    let items = match selection {
        Selection::Keyword(keyword) if is_all(&keyword) => return Ok(Targets::All),
        Selection::Keyword(keyword) => split_list(&keyword),
        Selection::List(items) => items,
    };
    let mut seen = HashSet::new();
    let mut codes = Vec::with_capacity(items.len());
    for item in &items {
        let code = item.parse::<CountryCode>()?;
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }
    Ok(Targets::Only(codes))
}

fn resolve_levels(selection: Selection<u32>) -> Result<Targets<u32>, VaultError> {
    let mut levels = match selection {
        Selection::Keyword(keyword) if is_all(&keyword) => return Ok(Targets::All),
        Selection::Keyword(keyword) => split_list(&keyword)
            .iter()
            .map(|item| parse_level(item))
            .collect::<Result<Vec<_>, _>>()?,
        Selection::List(items) => {
            if let Some(zero) = items.iter().find(|level| **level == 0) {
                return Err(VaultError::InvalidLevel(zero.to_string()));
            }
            items
        }
    };
    levels.sort_unstable();
    levels.dedup();
    Ok(Targets::Only(levels))
}
