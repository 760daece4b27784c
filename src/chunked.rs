use tracing::{info, warn};

use crate::domain::CountryCode;
use crate::error::{FailureKind, VaultError};
use crate::overpass::{FetchResponse, OverpassClient, Throttle};
use crate::query::{QueryBuilder, QueryOutput};
use crate::transform::{BoundaryRow, RowSet, to_rows};

pub const PROACTIVE_CHUNK_LEVEL: u32 = 8;

pub fn should_chunk(level: u32, failure: Option<FailureKind>) -> bool {
    if level <= 2 {
        return false;
    }
    failure == Some(FailureKind::TooLarge) || level >= PROACTIVE_CHUNK_LEVEL
}

pub fn parent_level(level: u32) -> u32 {
    level.saturating_sub(2).max(2)
}

#[derive(Debug, Clone)]
pub struct ChunkedOutcome {
    pub rows: Vec<BoundaryRow>,
    pub endpoint: String,
    pub parent_level: u32,
    pub parents: usize,
    pub duplicates: usize,
}

pub struct ChunkedFetcher<'a, C: OverpassClient + ?Sized> {
    client: &'a C,
    queries: &'a QueryBuilder,
}

impl<'a, C: OverpassClient + ?Sized> ChunkedFetcher<'a, C> {
    pub fn new(client: &'a C, queries: &'a QueryBuilder) -> Self {
        Self { client, queries }
    }

    pub fn fetch<F>(
        &self,
        country: &CountryCode,
        level: u32,
        throttle: &mut Throttle<'_>,
        mut on_part: F,
    ) -> Result<ChunkedOutcome, VaultError>
    where
        F: FnMut(usize, &FetchResponse) -> Result<(), VaultError>,
    {
        let parent_level = parent_level(level);
        throttle.pause();
        let parents = self.client.fetch(&self.queries.boundaries(
            country,
            parent_level,
            QueryOutput::Ids,
        ))?;
        let parent_ids = relation_ids(&parents);
        if parent_ids.is_empty() {
            return Err(VaultError::ChunkPartition {
                country: country.to_string(),
                level,
                parent_level,
            });
        }
        info!(
            country = %country,
            level,
            parent_level,
            parents = parent_ids.len(),
            "chunking by parent relations"
        );

        let mut merged = RowSet::new();
        let mut endpoints: Vec<String> = Vec::new();
        let mut duplicates = 0;
        for (index, parent_id) in parent_ids.iter().enumerate() {
            throttle.pause();
            let response = self
                .client
                .fetch(&self.queries.boundaries_within_parent(*parent_id, level))?;
            let part = index + 1;
            on_part(part, &response)?;
            let rows = to_rows(country, level, &response.payload);
            let fetched = rows.len();
            let replaced = merged.merge(rows);
            duplicates += replaced;
            if replaced > 0 {
                warn!(
                    country = %country,
                    level,
                    parent = parent_id,
                    replaced,
                    "chunk overlaps previous chunks"
                );
            }
            info!(
                country = %country,
                level,
                part,
                of = parent_ids.len(),
                parent = parent_id,
                rows = fetched,
                total = merged.len(),
                "chunk merged"
            );
            if !endpoints.contains(&response.endpoint) {
                endpoints.push(response.endpoint);
            }
        }

        Ok(ChunkedOutcome {
            rows: merged.into_rows(),
            endpoint: format!(
                "chunked(parent_level={parent_level}) {}",
                endpoints.join(",")
            ),
            parent_level,
            parents: parent_ids.len(),
            duplicates,
        })
    }
}

fn relation_ids(response: &FetchResponse) -> Vec<i64> {
    let mut ids = Vec::new();
    for element in response.elements() {
        if element.get("type").and_then(|v| v.as_str()) != Some("relation") {
            continue;
        }
        if let Some(id) = element.get("id").and_then(|v| v.as_i64()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
