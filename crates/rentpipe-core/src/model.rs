use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Number of individual LLM scoring calls folded into `average_score`.
pub const SCORES_LEN: usize = 8;

/// Magic default the original pipeline emits when every scoring call fails
/// to parse. Kept for wire compatibility; rows tagged with it carry
/// `scores = [0.0; SCORES_LEN]` so downstream queries can filter them out.
pub const SENTINEL_AVERAGE_SCORE: f64 = 13.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySource {
    Domain,
    RealEstate,
}

impl PropertySource {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertySource::Domain => "domain",
            PropertySource::RealEstate => "realestate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "domain" => Some(PropertySource::Domain),
            "realestate" => Some(PropertySource::RealEstate),
            _ => None,
        }
    }

    /// Substring that a listing URL for this source is expected to contain,
    /// used by the database sink's URL-scoped delisting sweep.
    pub fn url_marker(self) -> &'static str {
        match self {
            PropertySource::Domain => "domain.com.au",
            PropertySource::RealEstate => "realestate.com.au",
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    House,
    Apartment,
    Studio,
    SemiDetached,
    Townhouse,
    Villa,
    Duplex,
    Terrace,
}

impl PropertyType {
    pub fn code(self) -> u8 {
        match self {
            PropertyType::House => 1,
            PropertyType::Apartment => 2,
            PropertyType::Studio => 3,
            PropertyType::SemiDetached => 4,
            PropertyType::Townhouse => 5,
            PropertyType::Villa => 6,
            PropertyType::Duplex => 7,
            PropertyType::Terrace => 8,
        }
    }

    /// `other` maps to the same code as `townhouse` (5), per spec.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PropertyType::House,
            2 => PropertyType::Apartment,
            3 => PropertyType::Studio,
            4 => PropertyType::SemiDetached,
            6 => PropertyType::Villa,
            7 => PropertyType::Duplex,
            8 => PropertyType::Terrace,
            _ => PropertyType::Townhouse,
        }
    }

    pub fn from_raw_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("studio") {
            PropertyType::Studio
        } else if lower.contains("apartment") || lower.contains("unit") || lower.contains("flat") {
            PropertyType::Apartment
        } else if lower.contains("semi") {
            PropertyType::SemiDetached
        } else if lower.contains("townhouse") {
            PropertyType::Townhouse
        } else if lower.contains("villa") {
            PropertyType::Villa
        } else if lower.contains("duplex") {
            PropertyType::Duplex
        } else if lower.contains("terrace") {
            PropertyType::Terrace
        } else if lower.contains("house") {
            PropertyType::House
        } else {
            PropertyType::Townhouse
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum School {
    Unsw,
    Usyd,
    Uts,
}

impl School {
    pub const ALL: [School; 3] = [School::Unsw, School::Usyd, School::Uts];

    pub fn code(self) -> &'static str {
        match self {
            School::Unsw => "UNSW",
            School::Usyd => "USYD",
            School::Uts => "UTS",
        }
    }

    pub fn canonical_name(self) -> &'static str {
        match self {
            School::Unsw => "University of New South Wales",
            School::Usyd => "University of Sydney",
            School::Uts => "University of Technology Sydney",
        }
    }

    /// Maps both short codes and long forms onto the closed set of schools.
    pub fn parse(value: &str) -> Option<Self> {
        let normalised = value.trim().to_uppercase();
        match normalised.as_str() {
            "UNSW" => Some(School::Unsw),
            "USYD" => Some(School::Usyd),
            "UTS" => Some(School::Uts),
            _ => School::ALL
                .into_iter()
                .find(|s| s.canonical_name().to_uppercase() == normalised),
        }
    }
}

impl fmt::Display for School {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// `(name, state, postcode)` region triple, the sink's uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: String,
    pub state: String,
    pub postcode: u32,
}

impl RegionInfo {
    /// Scans `address_line2` for a trailing `... NSW <postcode>` token
    /// sequence and extracts the suburb name before it. When that shape
    /// isn't present, falls back to treating the whole string as a bare
    /// suburb name with a `postcode = 0` placeholder, leaving the fuzzy
    /// lookup/creation in the DB sink's `resolve_or_create_region` to
    /// reconcile it against existing regions. Only an empty
    /// `address_line2` yields `None`.
    ///
    /// Ported from `parse_region_from_address`: splits on `-`/` `, locates
    /// the `NSW` token and joins everything before it as the suburb; when
    /// no such token is found, normalises the whole string into a suburb
    /// name rather than dropping the row.
    pub fn from_address_line2(address_line2: &str) -> Option<Self> {
        let trimmed = address_line2.trim();
        if trimmed.is_empty() {
            return None;
        }

        let normalised = trimmed.replace(' ', "-");
        let parts: Vec<&str> = normalised.split('-').filter(|p| !p.is_empty()).collect();

        if parts.len() >= 3 {
            if let Some(nsw_index) = parts.iter().position(|part| part.trim().eq_ignore_ascii_case("NSW")) {
                if nsw_index > 0 && nsw_index < parts.len() - 1 {
                    let suburb = parts[..nsw_index]
                        .iter()
                        .map(|p| p.trim())
                        .collect::<Vec<_>>()
                        .join(" ")
                        .to_lowercase();
                    let postcode: u32 = parts[nsw_index + 1].trim().parse().unwrap_or(0);
                    return Some(RegionInfo { name: suburb, state: "NSW".to_string(), postcode });
                }
            }
        }

        let suburb = parts.iter().map(|p| p.trim()).collect::<Vec<_>>().join(" ").to_lowercase();
        if suburb.is_empty() {
            return None;
        }
        Some(RegionInfo { name: suburb, state: "NSW".to_string(), postcode: 0 })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub house_id: String,
    pub source: PropertySource,
    pub price_per_week: u32,
    pub address_line1: String,
    pub address_line2: String,
    pub suburb: String,
    pub state: String,
    pub postcode: String,
    pub bedroom_count: u32,
    pub bathroom_count: u32,
    pub parking_count: u32,
    pub property_type: PropertyType,
    pub description_en: Option<String>,
    pub description_cn: Option<String>,
    pub keywords: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub available_date: Option<NaiveDate>,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub average_score: Option<f64>,
    pub scores: Vec<f64>,
    pub commute_times: BTreeMap<School, Option<u32>>,
}

impl Property {
    pub fn new(house_id: impl Into<String>, source: PropertySource, scraped_at: DateTime<Utc>) -> Self {
        Self {
            house_id: house_id.into(),
            source,
            price_per_week: 0,
            address_line1: String::new(),
            address_line2: String::new(),
            suburb: String::new(),
            state: "NSW".to_string(),
            postcode: String::new(),
            bedroom_count: 0,
            bathroom_count: 0,
            parking_count: 0,
            property_type: PropertyType::House,
            description_en: None,
            description_cn: None,
            keywords: None,
            url: String::new(),
            thumbnail_url: None,
            available_date: None,
            published_at: None,
            scraped_at,
            average_score: None,
            scores: Vec::new(),
            commute_times: BTreeMap::new(),
        }
    }

    /// `address1-address2-houseId`, used to build portal detail URLs.
    pub fn combined_address(&self) -> String {
        format!("{}-{}-{}", self.address_line1, self.address_line2, self.house_id)
    }

    /// `address1, address2`, skipping empty parts. Used as the commute
    /// origin string builder's input before the `Australia` suffix is added.
    pub fn full_address(&self) -> String {
        [self.address_line1.as_str(), self.address_line2.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn has_details(&self) -> bool {
        self.description_en.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn needs_scoring(&self) -> bool {
        self.has_details() && self.average_score.is_none()
    }

    /// Mirrors `scoring.py::process_property`'s skip condition: every one
    /// of score, English keywords and Chinese description must already be
    /// present, not just the score, for scoring to be skipped.
    pub fn scoring_already_complete(&self) -> bool {
        self.average_score.is_some()
            && self.keywords.as_deref().is_some_and(|k| !k.is_empty())
            && self.description_cn.as_deref().is_some_and(|d| !d.is_empty())
    }
}

pub const CSV_COLUMNS: [&str; 20] = [
    "pricePerWeek",
    "addressLine1",
    "addressLine2",
    "bedroomCount",
    "bathroomCount",
    "parkingCount",
    "propertyType",
    "houseId",
    "url",
    "description_en",
    "description_cn",
    "keywords",
    "average_score",
    "available_date",
    "published_at",
    "thumbnail_url",
    "source",
    "commuteTime_UNSW",
    "commuteTime_USYD",
    "commuteTime_UTS",
];

impl Property {
    /// Serialises to the canonical CSV row, column order per `CSV_COLUMNS`.
    pub fn to_row(&self) -> Vec<String> {
        let commute = |school: School| {
            self.commute_times
                .get(&school)
                .and_then(|v| *v)
                .map(|m| m.to_string())
                .unwrap_or_default()
        };

        vec![
            self.price_per_week.to_string(),
            self.address_line1.clone(),
            self.address_line2.clone(),
            self.bedroom_count.to_string(),
            self.bathroom_count.to_string(),
            self.parking_count.to_string(),
            self.property_type.code().to_string(),
            self.house_id.clone(),
            self.url.clone(),
            self.description_en.clone().unwrap_or_default(),
            self.description_cn.clone().unwrap_or_default(),
            self.keywords.clone().unwrap_or_default(),
            self.average_score.map(|s| format!("{s:.1}")).unwrap_or_default(),
            self.available_date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
            self.published_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            self.thumbnail_url.clone().unwrap_or_default(),
            self.source.as_str().to_string(),
            commute(School::Unsw),
            commute(School::Usyd),
            commute(School::Uts),
        ]
    }

    /// Inverse of `to_row`. Unknown columns by position are ignored; a row
    /// with fewer columns than expected fills the trailing fields with
    /// their defaults.
    pub fn from_row(row: &[String], fallback_scraped_at: DateTime<Utc>) -> Option<Self> {
        let get = |idx: usize| row.get(idx).map(|s| s.as_str()).unwrap_or("");

        let house_id = get(7).to_string();
        if house_id.is_empty() {
            return None;
        }
        let source = PropertySource::parse(get(16))?;

        let mut property = Property::new(house_id, source, fallback_scraped_at);
        property.price_per_week = get(0).parse().unwrap_or(0);
        property.address_line1 = get(1).to_string();
        property.address_line2 = get(2).to_string();
        property.bedroom_count = get(3).parse().unwrap_or(0);
        property.bathroom_count = get(4).parse().unwrap_or(0);
        property.parking_count = get(5).parse().unwrap_or(0);
        property.property_type = PropertyType::from_code(get(6).parse().unwrap_or(5));
        property.url = get(8).to_string();
        property.description_en = non_empty(get(9));
        property.description_cn = non_empty(get(10));
        property.keywords = non_empty(get(11));
        property.average_score = get(12).parse().ok();
        property.available_date = NaiveDate::parse_from_str(get(13), "%Y-%m-%d").ok();
        property.published_at = DateTime::parse_from_rfc3339(get(14)).ok().map(|t| t.with_timezone(&Utc));
        property.thumbnail_url = non_empty(get(15));

        for school in School::ALL {
            let column = match school {
                School::Unsw => get(17),
                School::Usyd => get(18),
                School::Uts => get(19),
            };
            let minutes = non_empty(column).and_then(|v| v.parse::<u32>().ok());
            property.commute_times.insert(school, minutes);
        }

        Some(property)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_property() -> Property {
        let mut p = Property::new("2018543", PropertySource::Domain, Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        p.price_per_week = 750;
        p.address_line1 = "3/12 High St".to_string();
        p.address_line2 = "kensington-nsw-2033".to_string();
        p.bedroom_count = 2;
        p.bathroom_count = 1;
        p.parking_count = 1;
        p.property_type = PropertyType::Apartment;
        p.url = "https://www.domain.com.au/2018543".to_string();
        p.description_en = Some("Sunny 2-bed apartment".to_string());
        p.average_score = Some(14.0);
        p.commute_times.insert(School::Unsw, Some(28));
        p.commute_times.insert(School::Usyd, None);
        p.commute_times.insert(School::Uts, None);
        p
    }

    #[test]
    fn round_trip_identity() {
        let original = sample_property();
        let row = original.to_row();
        let restored = Property::from_row(&row, original.scraped_at).expect("parses back");
        assert_eq!(restored.house_id, original.house_id);
        assert_eq!(restored.source, original.source);
        assert_eq!(restored.price_per_week, original.price_per_week);
        assert_eq!(restored.address_line1, original.address_line1);
        assert_eq!(restored.bedroom_count, original.bedroom_count);
        assert_eq!(restored.average_score, original.average_score);
        assert_eq!(restored.commute_times, original.commute_times);
    }

    #[test]
    fn from_address_line2_parses_suburb_state_postcode() {
        let region = RegionInfo::from_address_line2("kensington-nsw-2033").expect("region parses");
        assert_eq!(region.name, "kensington");
        assert_eq!(region.state, "NSW");
        assert_eq!(region.postcode, 2033);
    }

    #[test]
    fn from_address_line2_falls_back_to_placeholder_postcode_on_zero() {
        let region = RegionInfo::from_address_line2("kensington-nsw-0").expect("suburb still resolves");
        assert_eq!(region.name, "kensington");
        assert_eq!(region.state, "NSW");
        assert_eq!(region.postcode, 0);
    }

    #[test]
    fn from_address_line2_falls_back_to_placeholder_region_without_nsw_token() {
        let region = RegionInfo::from_address_line2("kensington").expect("suburb still resolves");
        assert_eq!(region.name, "kensington");
        assert_eq!(region.state, "NSW");
        assert_eq!(region.postcode, 0);
    }

    #[test]
    fn from_address_line2_rejects_empty_string() {
        assert!(RegionInfo::from_address_line2("   ").is_none());
    }

    #[test]
    fn from_row_missing_house_id_returns_none() {
        let row: Vec<String> = CSV_COLUMNS.iter().map(|_| String::new()).collect();
        assert!(Property::from_row(&row, Utc::now()).is_none());
    }

    #[test]
    fn scoring_already_complete_requires_all_three_fields() {
        let mut p = sample_property();
        assert!(!p.scoring_already_complete());
        p.keywords = Some("sunny, quiet".to_string());
        p.description_cn = Some("阳光公寓".to_string());
        assert!(p.scoring_already_complete());
    }
}
