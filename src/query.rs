use crate::domain::CountryCode;

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutput {
    Geometry,
    Tags,
    Ids,
}

impl QueryOutput {
    fn statement(self) -> &'static str {
        match self {
            QueryOutput::Geometry => "out geom;",
            QueryOutput::Tags => "out tags;",
            QueryOutput::Ids => "out ids;",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    timeout_secs: u64,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT_SECS)
    }
}

impl QueryBuilder {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }

    fn header(&self) -> String {
        format!("[out:json][timeout:{}];", self.timeout_secs)
    }

    fn country_area(country: &CountryCode) -> String {
        format!(
            "area[\"ISO3166-1\"=\"{}\"][\"boundary\"=\"administrative\"][\"admin_level\"=\"2\"]->.country;",
            country.as_str()
        )
    }

    pub fn countries(&self) -> String {
        format!(
            "{}relation[\"boundary\"=\"administrative\"][\"admin_level\"=\"2\"][\"ISO3166-1\"~\"^[A-Z]{{2}}$\"];{}",
            self.header(),
            QueryOutput::Tags.statement()
        )
    }

    pub fn levels_for_country(&self, country: &CountryCode) -> String {
        format!(
            "{}{}relation(area.country)[\"boundary\"=\"administrative\"][\"admin_level\"];{}",
            self.header(),
            Self::country_area(country),
            QueryOutput::Tags.statement()
        )
    }

    pub fn boundaries(&self, country: &CountryCode, level: u32, output: QueryOutput) -> String {
        format!(
            "{}{}relation(area.country)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{level}\"];{}",
            self.header(),
            Self::country_area(country),
            output.statement()
        )
    }

    pub fn boundaries_within_parent(&self, parent_id: i64, level: u32) -> String {
        format!(
            "{}rel({parent_id});map_to_area->.parent;relation(area.parent)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{level}\"];{}",
            self.header(),
            QueryOutput::Geometry.statement()
        )
    }
}
