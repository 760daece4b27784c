use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::LevelCatalog;
use crate::chunked::{ChunkedFetcher, should_chunk};
use crate::config::{ResolvedConfig, Targets};
use crate::countries::{CountriesRecord, load_country_codes, parse_countries};
use crate::discovery::discover_levels;
use crate::domain::CountryCode;
use crate::error::VaultError;
use crate::overpass::{OverpassClient, Throttle};
use crate::query::{QueryBuilder, QueryOutput};
use crate::store::{
    BackupRecord, Layout, RawReference, file_name, now_timestamp, write_bytes_atomic,
    write_record,
};
use crate::transform::to_rows;

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub country_code: String,
    pub level: u32,
    pub rows: usize,
    pub path: String,
    pub endpoint: String,
    pub chunked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    pub country_code: String,
    pub level: Option<u32>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub countries: usize,
    pub written: Vec<TargetReport>,
    pub skipped_existing: usize,
    pub skipped_countries: Vec<String>,
    pub failures: Vec<TargetFailure>,
    pub requests: usize,
}

impl RunSummary {
    pub fn targets(&self) -> usize {
        self.written.len() + self.skipped_existing + self.failures.len()
    }
}

pub struct Runner<C: OverpassClient> {
    client: C,
    config: ResolvedConfig,
    layout: Layout,
    queries: QueryBuilder,
    sleep: Box<dyn Fn(Duration)>,
}

impl<C: OverpassClient> Runner<C> {
    pub fn new(client: C, config: ResolvedConfig) -> Self {
        let layout = Layout::new(config.output_dir.clone());
        let queries = QueryBuilder::new(config.timeout.as_secs().max(1));
        Self {
            client,
            config,
            layout,
            queries,
            sleep: Box::new(thread::sleep),
        }
    }

    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn run(&self) -> Result<RunSummary, VaultError> {
        let started_at = now_timestamp();
        let clock = Instant::now();
        let full_sweep = self.config.is_full_sweep();
        self.layout.ensure_root()?;
        info!(
            output = %self.layout.root(),
            full_sweep,
            missing_only = self.config.missing_only,
            "backup run started"
        );

        let mut throttle = Throttle::with_sleep(self.config.delay, |delay| (self.sleep)(delay));
        let mut summary = RunSummary {
            started_at: started_at.clone(),
            ..RunSummary::default()
        };
        let countries = self.resolve_countries(&started_at, full_sweep, &mut throttle)?;
        summary.countries = countries.len();

        let mut catalog = if full_sweep {
            LevelCatalog::load(&self.layout.catalog_path())
        } else {
            LevelCatalog::new()
        };

        for country in &countries {
            let levels =
                match self.resolve_levels(country, full_sweep, &mut catalog, &mut throttle) {
                    Ok(levels) => levels,
                    Err(err) => {
                        error!(country = %country, "level discovery failed: {err}");
                        summary.failures.push(TargetFailure {
                            country_code: country.to_string(),
                            level: None,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
            if levels.is_empty() {
                info!(country = %country, "no admin levels, skipping country");
                summary.skipped_countries.push(country.to_string());
                continue;
            }

            for level in levels {
                if self.config.missing_only && self.layout.backup_exists(country, level) {
                    info!(country = %country, level, "backup exists, skipping");
                    summary.skipped_existing += 1;
                    continue;
                }
                match self.backup_target(country, level, &started_at, &mut throttle) {
                    Ok(report) => summary.written.push(report),
                    Err(err) => {
                        error!(country = %country, level, "backup failed: {err}");
                        summary.failures.push(TargetFailure {
                            country_code: country.to_string(),
                            level: Some(level),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        if catalog.is_changed() {
            catalog.save(&self.layout.catalog_path(), &started_at)?;
        }

        summary.requests = throttle.requests();
        info!(
            written = summary.written.len(),
            skipped = summary.skipped_existing,
            failed = summary.failures.len(),
            requests = summary.requests,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "backup run finished"
        );
        Ok(summary)
    }

    fn resolve_countries(
        &self,
        started_at: &str,
        full_sweep: bool,
        throttle: &mut Throttle<'_>,
    ) -> Result<Vec<CountryCode>, VaultError> {
        if let Targets::Only(countries) = &self.config.countries {
            return Ok(countries.clone());
        }

        let countries_path = self.layout.countries_path();
        if full_sweep {
            if let Some(codes) = load_country_codes(&countries_path) {
                info!(path = %countries_path, count = codes.len(), "countries from existing file");
                return Ok(codes);
            }
        }

        throttle.pause();
        let response = self.client.fetch(&self.queries.countries())?;
        let entries = parse_countries(&response.payload);
        let codes = entries
            .iter()
            .map(|entry| entry.country_code.clone())
            .collect::<Vec<_>>();
        info!(endpoint = %response.endpoint, count = codes.len(), "discovered countries");

        let raw_reference = if self.config.retain_raw {
            let raw_path = self.layout.countries_raw_path();
            write_bytes_atomic(&raw_path, response.raw_text.as_bytes())?;
            Some(RawReference::File(file_name(&raw_path)))
        } else {
            None
        };
        let mut record = CountriesRecord::new(response.endpoint, entries, raw_reference);
        write_record(&countries_path, &mut record, started_at, false)?;
        Ok(codes)
    }

    fn resolve_levels(
        &self,
        country: &CountryCode,
        full_sweep: bool,
        catalog: &mut LevelCatalog,
        throttle: &mut Throttle<'_>,
    ) -> Result<Vec<u32>, VaultError> {
        if let Targets::Only(levels) = &self.config.levels {
            return Ok(levels.clone());
        }
        if full_sweep {
            if let Some(levels) = catalog.get(country) {
                info!(country = %country, "levels {:?} from catalog", levels);
                return Ok(levels.to_vec());
            }
        }
        throttle.pause();
        let levels = discover_levels(&self.client, &self.queries, country)?;
        if full_sweep {
            catalog.record(country.clone(), levels.clone());
        }
        Ok(levels)
    }

    fn backup_target(
        &self,
        country: &CountryCode,
        level: u32,
        started_at: &str,
        throttle: &mut Throttle<'_>,
    ) -> Result<TargetReport, VaultError> {
        throttle.pause();
        let query = self
            .queries
            .boundaries(country, level, QueryOutput::Geometry);
        let (rows, endpoint, raw_reference, chunked) = match self.client.fetch(&query) {
            Ok(response) => {
                let rows = to_rows(country, level, &response.payload);
                let raw_reference = if self.config.retain_raw {
                    let raw_path = self.layout.raw_path(country, level);
                    write_bytes_atomic(&raw_path, response.raw_text.as_bytes())?;
                    Some(RawReference::File(file_name(&raw_path)))
                } else {
                    None
                };
                (rows, response.endpoint, raw_reference, false)
            }
            Err(err @ VaultError::FetchFailed { .. })
                if should_chunk(level, err.failure_kind()) =>
            {
                warn!(country = %country, level, "direct fetch failed, falling back to chunks: {err}");
                let mut parts = Vec::new();
                let outcome = ChunkedFetcher::new(&self.client, &self.queries).fetch(
                    country,
                    level,
                    throttle,
                    |part, response| {
                        if self.config.retain_raw {
                            let part_path = self.layout.raw_part_path(country, level, part);
                            write_bytes_atomic(&part_path, response.raw_text.as_bytes())?;
                            parts.push(file_name(&part_path));
                        }
                        Ok(())
                    },
                )?;
                info!(
                    country = %country,
                    level,
                    parents = outcome.parents,
                    duplicates = outcome.duplicates,
                    "chunked fetch complete"
                );
                let raw_reference = (!parts.is_empty()).then_some(RawReference::Parts(parts));
                (outcome.rows, outcome.endpoint, raw_reference, true)
            }
            Err(err) => return Err(err),
        };

        let keep = raw_reference
            .as_ref()
            .map(RawReference::files)
            .unwrap_or_default();
        let row_count = rows.len();
        let mut record = BackupRecord::new(
            country.clone(),
            level,
            endpoint.clone(),
            rows,
            raw_reference,
        );
        let path: Utf8PathBuf = write_record(
            &self.layout.backup_path(country, level),
            &mut record,
            started_at,
            self.config.compress,
        )?;
        info!(country = %country, level, rows = row_count, path = %path, "backup written");
        let stale = self.layout.prune_raw_sidecars(country, level, &keep)?;
        if !stale.is_empty() {
            debug!(country = %country, level, "removed stale raw files {:?}", stale);
        }
        Ok(TargetReport {
            country_code: country.to_string(),
            level,
            rows: row_count,
            path: path.to_string(),
            endpoint,
            chunked,
        })
    }
}
