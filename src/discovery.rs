use std::collections::BTreeSet;

use serde_json::Value;
use tracing::info;

use crate::domain::CountryCode;
use crate::error::VaultError;
use crate::overpass::{OverpassClient, elements};
use crate::query::QueryBuilder;

pub fn discover_levels<C: OverpassClient + ?Sized>(
    client: &C,
    queries: &QueryBuilder,
    country: &CountryCode,
) -> Result<Vec<u32>, VaultError> {
    let response = client.fetch(&queries.levels_for_country(country))?;
    let levels = extract_levels(&response.payload);
    info!(
        country = %country,
        endpoint = %response.endpoint,
        "discovered levels {:?}",
        levels
    );
    Ok(levels)
}

pub fn extract_levels(payload: &Value) -> Vec<u32> {
    elements(payload)
        .iter()
        .filter_map(|element| element.get("tags"))
        .filter_map(|tags| tags.get("admin_level"))
        .filter_map(|value| value.as_str())
        .filter_map(|value| value.trim().parse::<u32>().ok())
        .filter(|level| *level > 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
