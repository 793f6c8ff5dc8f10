use crate::model::{Property, PropertySource, PropertyType};
use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::fmt;

pub const MAX_PAGES_PER_AREA: u32 = 7;
pub const DESCRIPTION_MAX_LEN: usize = 1024;

const THUMBNAIL_BLACKLIST: [&str; 7] = [
    "logo", "avatar", "agent", "agency", "brand", "profile", "icon",
];

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("listing card {index} is missing identity or price, dropped")]
    MissingIdentity { index: usize },
    #[error("failed to build search URL for area '{area}': {reason}")]
    InvalidArea { area: String, reason: String },
}

pub trait SiteAdapter: Send + Sync {
    fn source(&self) -> PropertySource;
    fn search_url(&self, area: &str) -> Result<String, AdapterError>;
    fn paginate(&self, current_url: &str, page_n: u32) -> String;
    fn parse_list(&self, html: &str) -> Vec<Property>;
    fn parse_detail(&self, html: &str, property: &mut Property);
    fn has_next(&self, html: &str) -> bool;
}

/// `$NNNN (per week|pw|/week)`, whitespace/comma tolerant, first match wins.
static PRICE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$\s*([\d,]+)\s*(?:per\s*week|pw|/\s*week)").expect("valid price regex")
});

pub fn extract_price(text: &str) -> u32 {
    PRICE_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace(',', ""))
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// `abs(hash(lowercase, no-space address+postcode)) % 10^9`, a deliberately
/// weak but reproducible fallback identifier, ported from
/// `helpers.py::generate_house_id`.
pub fn generate_house_id(address: &str, postcode: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let key = format!("{address}{postcode}")
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % 1_000_000_000).to_string()
}

/// Truncates to `DESCRIPTION_MAX_LEN` characters with a trailing ellipsis,
/// operating on chars (not bytes) to stay UTF-8 safe.
pub fn truncate_description(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= DESCRIPTION_MAX_LEN {
        return text.to_string();
    }
    let mut truncated: String = chars[..DESCRIPTION_MAX_LEN].iter().collect();
    truncated.push('\u{2026}');
    truncated
}

pub fn is_valid_image_url(url: &str, source_pattern: &Regex) -> bool {
    let http_count = url.matches("http://").count() + url.matches("https://").count();
    if http_count != 1 {
        return false;
    }
    if !source_pattern.is_match(url) {
        return false;
    }
    let lower = url.to_lowercase();
    !THUMBNAIL_BLACKLIST.iter().any(|token| lower.contains(token))
}

/// Parses `"Available Now"`, `"Available from 3rd December 2026"`, and bare
/// dates in four formats, stripping ordinal suffixes (`1st`, `2nd`, `3rd`,
/// `4th`, ...) before delegating to `chrono`, ported from
/// `helpers.py::parse_available_date`.
pub fn parse_available_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("available now") {
        return None;
    }

    let stripped = trimmed
        .to_lowercase()
        .trim_start_matches("available from")
        .trim()
        .to_string();

    let no_ordinals = strip_ordinal_suffixes(&stripped);

    const FORMATS: [&str; 4] = ["%d %B %Y", "%d %b %Y", "%Y-%m-%d", "%d/%m/%Y"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&no_ordinals, fmt).ok())
}

fn strip_ordinal_suffixes(input: &str) -> String {
    static ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)(st|nd|rd|th)").expect("valid ordinal regex"));
    ORDINAL.replace_all(input, "$1").to_string()
}

pub fn jittered_delay_ms() -> u64 {
    use rand::Rng;
    let base_ms = 3_000u64;
    let jitter_ms = rand::thread_rng().gen_range(2_000..=5_000u64);
    base_ms + jitter_ms
}

/// Portal-D adapter.
pub struct DomainAdapter;

impl fmt::Debug for DomainAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainAdapter").finish()
    }
}

static DOMAIN_THUMBNAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bucket-api\.domain\.com\.au").expect("valid domain thumbnail regex"));

impl SiteAdapter for DomainAdapter {
    fn source(&self) -> PropertySource {
        PropertySource::Domain
    }

    fn search_url(&self, area: &str) -> Result<String, AdapterError> {
        if area.trim().is_empty() {
            return Err(AdapterError::InvalidArea {
                area: area.to_string(),
                reason: "area token is empty".to_string(),
            });
        }
        Ok(format!("https://www.domain.com.au/rent/{area}/"))
    }

    fn paginate(&self, current_url: &str, page_n: u32) -> String {
        let base = current_url.trim_end_matches('/');
        format!("{base}?page={page_n}")
    }

    fn parse_list(&self, html: &str) -> Vec<Property> {
        let document = Html::parse_document(html);
        let card_selector = Selector::parse("article[data-testid=\"listing-card-wrapper\"]")
            .expect("valid card selector");
        let price_selector = Selector::parse("[data-testid=\"listing-card-price\"]").expect("valid selector");
        let address_selector = Selector::parse("[data-testid=\"address-line1\"]").expect("valid selector");
        let suburb_selector = Selector::parse("[data-testid=\"address-line2\"]").expect("valid selector");
        let feature_selector = Selector::parse("[data-testid=\"property-features-feature\"]")
            .expect("valid selector");
        let link_selector = Selector::parse("a[href]").expect("valid selector");
        let type_selector = Selector::parse("[data-testid=\"property-type\"]").expect("valid selector");

        let mut properties = Vec::new();
        for (index, card) in document.select(&card_selector).enumerate() {
            let price_text = card.select(&price_selector).next().map(text_of).unwrap_or_default();
            let price = extract_price(&price_text);

            let url = card
                .select(&link_selector)
                .next()
                .and_then(|a| a.value().attr("href"))
                .unwrap_or_default()
                .to_string();

            let house_id = card
                .value()
                .attr("data-testid")
                .and_then(|v| v.strip_prefix("listing-"))
                .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
                .or_else(|| {
                    url.trim_end_matches('/')
                        .rsplit('-')
                        .next()
                        .filter(|s| s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty())
                        .map(str::to_string)
                });

            let address_line1 = card.select(&address_selector).next().map(text_of).unwrap_or_default();
            let address_line2 = card.select(&suburb_selector).next().map(text_of).unwrap_or_default();

            let house_id = house_id.unwrap_or_else(|| generate_house_id(&address_line1, &address_line2));

            if price == 0 || house_id.is_empty() {
                tracing::debug!(index, "Domain listing card dropped: missing identity or price");
                continue;
            }

            let mut property = Property::new(house_id, PropertySource::Domain, Utc::now());
            property.price_per_week = price;
            property.address_line1 = address_line1;
            property.address_line2 = address_line2.to_lowercase().replace(' ', "-");
            property.url = if url.starts_with("http") {
                url
            } else {
                format!("https://www.domain.com.au{url}")
            };

            let features: Vec<u32> = card
                .select(&feature_selector)
                .filter_map(|el| text_of(el).split_whitespace().next().and_then(|s| s.parse().ok()))
                .collect();
            property.bedroom_count = features.first().copied().unwrap_or(0);
            property.bathroom_count = features.get(1).copied().unwrap_or(0);
            property.parking_count = features.get(2).copied().unwrap_or(0);

            if let Some(type_text) = card.select(&type_selector).next().map(text_of) {
                property.property_type = PropertyType::from_raw_label(&type_text);
            }

            properties.push(property);
        }
        properties
    }

    fn parse_detail(&self, html: &str, property: &mut Property) {
        let document = Html::parse_document(html);
        let description_selector = Selector::parse("[data-testid=\"listing-details__description\"]")
            .expect("valid selector");
        if let Some(el) = document.select(&description_selector).next() {
            property.description_en = Some(truncate_description(&text_of(el)));
        }

        let image_selector = Selector::parse("img[src]").expect("valid selector");
        property.thumbnail_url = document
            .select(&image_selector)
            .filter_map(|el| el.value().attr("src"))
            .find(|src| is_valid_image_url(src, &DOMAIN_THUMBNAIL_PATTERN))
            .map(str::to_string);

        let available_selector = Selector::parse("[data-testid=\"listing-details__availability\"]")
            .expect("valid selector");
        property.available_date = document
            .select(&available_selector)
            .next()
            .and_then(|el| parse_available_date(&text_of(el)));

        property.published_at = Some(Utc::now());
    }

    fn has_next(&self, html: &str) -> bool {
        html.contains("data-testid=\"paginator-next-button\"")
    }
}

/// Portal-R adapter.
pub struct RealEstateAdapter;

impl fmt::Debug for RealEstateAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealEstateAdapter").finish()
    }
}

static REALESTATE_THUMBNAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)i2\.au\.reastatic\.net/\d+x\d+.*?/[a-f0-9]+/image\.jpg")
        .expect("valid realestate thumbnail regex")
});

/// First 4-digit run in an area token, treated as its postcode.
static REALESTATE_POSTCODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}").expect("valid postcode regex"));

impl SiteAdapter for RealEstateAdapter {
    fn source(&self) -> PropertySource {
        PropertySource::RealEstate
    }

    fn search_url(&self, area: &str) -> Result<String, AdapterError> {
        if area.trim().is_empty() {
            return Err(AdapterError::InvalidArea {
                area: area.to_string(),
                reason: "area token is empty".to_string(),
            });
        }
        let postcode = REALESTATE_POSTCODE_PATTERN
            .find(area)
            .map(|m| m.as_str().to_string());
        match postcode {
            Some(postcode) => Ok(format!("https://www.realestate.com.au/rent/in-{postcode}/list-1")),
            None => Ok(format!("https://www.realestate.com.au/rent/in-{area}/list-1")),
        }
    }

    fn paginate(&self, current_url: &str, page_n: u32) -> String {
        static LIST_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"/list-\d+$").expect("valid list suffix regex"));
        LIST_SUFFIX.replace(current_url, format!("/list-{page_n}")).to_string()
    }

    fn parse_list(&self, html: &str) -> Vec<Property> {
        let document = Html::parse_document(html);
        let card_selector = Selector::parse("article[data-testid=\"ResidentialCard\"]").expect("valid selector");
        let price_selector = Selector::parse("[data-testid=\"listing-card-price\"], .property-price")
            .expect("valid selector");
        let address1_selector = Selector::parse("[data-testid=\"address-line1\"]").expect("valid selector");
        let address2_selector = Selector::parse("[data-testid=\"address-line2\"]").expect("valid selector");
        let link_selector = Selector::parse("a[href]").expect("valid selector");
        let feature_selector = Selector::parse("[data-testid=\"property-features-text-container\"]")
            .expect("valid selector");
        let type_selector = Selector::parse("[data-testid=\"property-type\"]").expect("valid selector");

        let mut properties = Vec::new();
        for (index, card) in document.select(&card_selector).enumerate() {
            let price_text = card.select(&price_selector).next().map(text_of).unwrap_or_default();
            let price = extract_price(&price_text);

            let url = card
                .select(&link_selector)
                .next()
                .and_then(|a| a.value().attr("href"))
                .unwrap_or_default()
                .to_string();

            let house_id = card
                .value()
                .attr("data-listing-id")
                .map(|v| v.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
                .filter(|v| !v.is_empty())
                .or_else(|| {
                    static TRAILING_DIGITS: Lazy<Regex> =
                        Lazy::new(|| Regex::new(r"-(\d{7,})$").expect("valid trailing digits regex"));
                    TRAILING_DIGITS
                        .captures(&url)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                });

            let address_line1 = card.select(&address1_selector).next().map(text_of).unwrap_or_default();
            let address_line2 = card.select(&address2_selector).next().map(text_of).unwrap_or_default();

            let house_id = house_id.unwrap_or_else(|| generate_house_id(&address_line1, &address_line2));

            if price == 0 || house_id.is_empty() {
                tracing::debug!(index, "RealEstate listing card dropped: missing identity or price");
                continue;
            }

            let mut property = Property::new(house_id, PropertySource::RealEstate, Utc::now());
            property.price_per_week = price;
            property.address_line1 = address_line1;
            property.address_line2 = address_line2.to_lowercase().replace(' ', "-");
            property.url = if url.starts_with("http") {
                url
            } else {
                format!("https://www.realestate.com.au{url}")
            };

            let features: Vec<u32> = card
                .select(&feature_selector)
                .filter_map(|el| text_of(el).split_whitespace().next().and_then(|s| s.parse().ok()))
                .collect();
            property.bedroom_count = features.first().copied().unwrap_or(0);
            property.bathroom_count = features.get(1).copied().unwrap_or(0);
            property.parking_count = features.get(2).copied().unwrap_or(0);

            if let Some(type_text) = card.select(&type_selector).next().map(text_of) {
                property.property_type = PropertyType::from_raw_label(&type_text);
            }

            properties.push(property);
        }
        properties
    }

    fn parse_detail(&self, html: &str, property: &mut Property) {
        let document = Html::parse_document(html);
        let description_selector = Selector::parse("[data-testid=\"listing-details__description\"]")
            .expect("valid selector");
        if let Some(el) = document.select(&description_selector).next() {
            property.description_en = Some(truncate_description(&text_of(el)));
        }

        let image_selector = Selector::parse("img[src]").expect("valid selector");
        property.thumbnail_url = document
            .select(&image_selector)
            .filter_map(|el| el.value().attr("src"))
            .find(|src| is_valid_image_url(src, &REALESTATE_THUMBNAIL_PATTERN))
            .map(str::to_string);

        let available_selector = Selector::parse(".property-info__availability").expect("valid selector");
        property.available_date = document
            .select(&available_selector)
            .next()
            .and_then(|el| parse_available_date(&text_of(el)));

        property.published_at = Some(Utc::now());
    }

    fn has_next(&self, html: &str) -> bool {
        html.contains("rel=\"next\"") || html.contains("aria-label=\"Next page\"")
    }
}

fn text_of(el: scraper::ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// Used by the pipeline orchestrator to build the canonical checkpoint
/// filename date token (`YYMMDD`), kept here since it is adapter-adjacent
/// pure formatting rather than a full telemetry concern.
pub fn yymmdd(date: chrono::DateTime<Utc>) -> String {
    format!("{:02}{:02}{:02}", date.year() % 100, date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_price_handles_commas_and_pw_suffix() {
        assert_eq!(extract_price("$1,250 pw"), 1250);
        assert_eq!(extract_price("$750 per week"), 750);
        assert_eq!(extract_price("Contact agent"), 0);
    }

    #[test]
    fn extract_price_takes_first_match() {
        assert_eq!(extract_price("$500 pw (was $600 pw)"), 500);
    }

    #[test]
    fn generate_house_id_is_deterministic() {
        let a = generate_house_id("3/12 High St", "2033");
        let b = generate_house_id("3/12 High St", "2033");
        assert_eq!(a, b);
    }

    #[test]
    fn generate_house_id_ignores_case_and_spaces() {
        let a = generate_house_id("3/12 High St", "2033");
        let b = generate_house_id("3/12 HIGH ST", "2033");
        assert_eq!(a, b);
    }

    #[test]
    fn truncate_description_adds_ellipsis_past_limit() {
        let long = "a".repeat(DESCRIPTION_MAX_LEN + 10);
        let truncated = truncate_description(&long);
        assert_eq!(truncated.chars().count(), DESCRIPTION_MAX_LEN + 1);
        assert!(truncated.ends_with('\u{2026}'));
    }

    #[test]
    fn truncate_description_leaves_short_text_untouched() {
        assert_eq!(truncate_description("short"), "short");
    }

    #[test]
    fn parse_available_date_handles_available_now() {
        assert!(parse_available_date("Available Now").is_none());
    }

    #[test]
    fn parse_available_date_strips_ordinal_suffix() {
        let date = parse_available_date("Available from 3rd December 2026").expect("parses");
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 12, 3).unwrap());
    }

    #[test]
    fn parse_available_date_handles_iso_format() {
        let date = parse_available_date("2026-08-15").expect("parses");
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 8, 15).unwrap());
    }

    #[test]
    fn is_valid_image_url_rejects_blacklisted_tokens() {
        let pattern = Regex::new(r"example\.com").unwrap();
        assert!(!is_valid_image_url("https://example.com/agent-logo.jpg", &pattern));
        assert!(is_valid_image_url("https://example.com/photo.jpg", &pattern));
    }

    #[test]
    fn is_valid_image_url_rejects_double_scheme() {
        let pattern = Regex::new(r"example\.com").unwrap();
        assert!(!is_valid_image_url("https://example.com/http://evil.com/x.jpg", &pattern));
    }

    #[test]
    fn realestate_search_url_extracts_postcode_when_present() {
        let adapter = RealEstateAdapter;
        assert_eq!(
            adapter.search_url("kensington-nsw-2033").unwrap(),
            "https://www.realestate.com.au/rent/in-2033/list-1"
        );
    }

    #[test]
    fn realestate_search_url_falls_back_to_raw_area_without_postcode() {
        let adapter = RealEstateAdapter;
        assert_eq!(
            adapter.search_url("sydney-city-nsw").unwrap(),
            "https://www.realestate.com.au/rent/in-sydney-city-nsw/list-1"
        );
    }

    #[test]
    fn realestate_search_url_rejects_empty_area() {
        let adapter = RealEstateAdapter;
        assert!(adapter.search_url("   ").is_err());
    }

    #[test]
    fn realestate_paginate_replaces_list_suffix() {
        let adapter = RealEstateAdapter;
        let url = "https://www.realestate.com.au/rent/in-2033/list-1";
        assert_eq!(adapter.paginate(url, 3), "https://www.realestate.com.au/rent/in-2033/list-3");
    }

    #[test]
    fn domain_parse_list_drops_cards_without_price() {
        let html = r#"<html><body>
            <article data-testid="listing-card-wrapper">
                <div data-testid="listing-card-price">Contact Agent</div>
                <div data-testid="address-line1">3/12 High St</div>
                <div data-testid="address-line2">Kensington NSW 2033</div>
                <a href="/123456"></a>
            </article>
        </body></html>"#;
        let adapter = DomainAdapter;
        assert!(adapter.parse_list(html).is_empty());
    }

    #[test]
    fn domain_parse_list_extracts_a_valid_card() {
        let html = r#"<html><body>
            <article data-testid="listing-card-wrapper">
                <div data-testid="listing-card-price">$750 per week</div>
                <div data-testid="address-line1">3/12 High St</div>
                <div data-testid="address-line2">Kensington NSW 2033</div>
                <a href="https://www.domain.com.au/3-12-high-st-kensington-nsw-2033-2018543"></a>
            </article>
        </body></html>"#;
        let adapter = DomainAdapter;
        let properties = adapter.parse_list(html);
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].price_per_week, 750);
        assert_eq!(properties[0].house_id, "2018543");
    }
}
