use crate::model::{Property, School};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;

/// History entries are ignored once older than this.
const MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone)]
struct CachedEntry {
    description_en: Option<String>,
    description_cn: Option<String>,
    keywords: Option<String>,
    average_score: Option<f64>,
    scores: Vec<f64>,
    available_date: Option<chrono::NaiveDate>,
    thumbnail_url: Option<String>,
    commute_times: std::collections::BTreeMap<School, Option<u32>>,
}

/// Immutable, loaded once per `(university, source)` sweep and read
/// concurrently by the DETAIL/SCORE/COMMUTE stages.
#[derive(Debug, Default)]
pub struct HistoryCache {
    entries: HashMap<String, CachedEntry>,
    pub source_path: Option<std::path::PathBuf>,
}

/// Per-field reuse bookkeeping the orchestrator folds into the sweep summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseOutcome {
    Reused,
    Fresh,
}

impl HistoryCache {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scans `output_dir` for `{university}_rentdata_{YYMMDD}.csv` files
    /// (list-segment / merge-checkpoint files are excluded by filename
    /// pattern), picks the newest, and returns an empty cache if none is
    /// found or the newest is older than `MAX_AGE_DAYS`.
    pub fn load(output_dir: &Path, university: &str, today: DateTime<Utc>) -> std::io::Result<Self> {
        let prefix = format!("{}_rentdata_", university.to_uppercase());
        let mut newest: Option<(chrono::NaiveDate, std::path::PathBuf)> = None;

        if output_dir.is_dir() {
            for entry in std::fs::read_dir(output_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&prefix) || !name.ends_with(".csv") {
                    continue;
                }
                if name.contains("_list_") {
                    continue;
                }
                let date_token = name
                    .trim_start_matches(&prefix)
                    .trim_end_matches(".csv");
                let Some(date) = parse_yymmdd(date_token) else {
                    continue;
                };
                if newest.as_ref().is_none_or(|(d, _)| date > *d) {
                    newest = Some((date, entry.path()));
                }
            }
        }

        let Some((date, path)) = newest else {
            return Ok(Self::empty());
        };

        if today.date_naive() - date > Duration::days(MAX_AGE_DAYS) {
            return Ok(Self::empty());
        }

        let contents = std::fs::read_to_string(&path)?;
        let mut cache = Self::from_csv_str(&contents, today);
        cache.source_path = Some(path);
        Ok(cache)
    }

    fn from_csv_str(contents: &str, today: DateTime<Utc>) -> Self {
        let mut entries = HashMap::new();
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(contents.as_bytes());
        for record in reader.records().flatten() {
            let row: Vec<String> = record.iter().map(str::to_string).collect();
            let Some(property) = Property::from_row(&row, today) else {
                continue;
            };
            if property.description_en.as_deref().unwrap_or("").is_empty() {
                continue;
            }
            entries.insert(
                property.house_id.clone(),
                CachedEntry {
                    description_en: property.description_en,
                    description_cn: property.description_cn,
                    keywords: property.keywords,
                    average_score: property.average_score,
                    scores: property.scores,
                    available_date: property.available_date,
                    thumbnail_url: property.thumbnail_url,
                    commute_times: property.commute_times,
                },
            );
        }
        Self { entries, source_path: None }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, house_id: &str) -> bool {
        self.entries.contains_key(house_id)
    }

    /// Fills only missing/zero fields on `property` from the cached entry
    /// matching its `house_id`; never overwrites a freshly scraped
    /// non-empty value. Returns one outcome per merged field category.
    pub fn merge_into(&self, property: &mut Property) -> Vec<(&'static str, ReuseOutcome)> {
        let mut outcomes = Vec::new();
        let Some(cached) = self.entries.get(&property.house_id) else {
            outcomes.push(("description", ReuseOutcome::Fresh));
            outcomes.push(("score", ReuseOutcome::Fresh));
            outcomes.push(("commute", ReuseOutcome::Fresh));
            return outcomes;
        };

        if property.description_en.as_deref().unwrap_or("").is_empty() {
            property.description_en = cached.description_en.clone();
            property.description_cn = cached.description_cn.clone();
            property.keywords = cached.keywords.clone();
            property.thumbnail_url = property.thumbnail_url.clone().or_else(|| cached.thumbnail_url.clone());
            property.available_date = property.available_date.or(cached.available_date);
            outcomes.push(("description", ReuseOutcome::Reused));
        } else {
            outcomes.push(("description", ReuseOutcome::Fresh));
        }

        if property.average_score.is_none() {
            property.average_score = cached.average_score;
            if !cached.scores.is_empty() {
                property.scores = cached.scores.clone();
            }
            outcomes.push(("score", ReuseOutcome::Reused));
        } else {
            outcomes.push(("score", ReuseOutcome::Fresh));
        }

        let mut any_commute_reused = false;
        for (school, cached_minutes) in &cached.commute_times {
            let slot = property.commute_times.entry(*school).or_insert(None);
            if slot.is_none() && cached_minutes.is_some() {
                *slot = *cached_minutes;
                any_commute_reused = true;
            }
        }
        outcomes.push((
            "commute",
            if any_commute_reused { ReuseOutcome::Reused } else { ReuseOutcome::Fresh },
        ));

        outcomes
    }
}

fn parse_yymmdd(token: &str) -> Option<chrono::NaiveDate> {
    if token.len() != 6 || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let yy: i32 = token[0..2].parse().ok()?;
    let mm: u32 = token[2..4].parse().ok()?;
    let dd: u32 = token[4..6].parse().ok()?;
    chrono::NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertySource;
    use chrono::TimeZone;

    #[test]
    fn parse_yymmdd_roundtrips() {
        assert_eq!(parse_yymmdd("260731"), chrono::NaiveDate::from_ymd_opt(2026, 7, 31));
        assert_eq!(parse_yymmdd("bad"), None);
    }

    #[test]
    fn empty_cache_merge_reports_fresh() {
        let cache = HistoryCache::empty();
        let mut property = Property::new("1", PropertySource::Domain, Utc::now());
        let outcomes = cache.merge_into(&mut property);
        assert!(outcomes.iter().all(|(_, o)| *o == ReuseOutcome::Fresh));
    }

    #[test]
    fn merge_into_fills_missing_description_only() {
        let today = Utc.with_ymd_and_hms(2026, 7, 31, 0, 0, 0).unwrap();
        let csv = "pricePerWeek,addressLine1,addressLine2,bedroomCount,bathroomCount,parkingCount,propertyType,houseId,url,description_en,description_cn,keywords,average_score,available_date,published_at,thumbnail_url,source,commuteTime_UNSW,commuteTime_USYD,commuteTime_UTS\n\
750,3/12 High St,kensington-nsw-2033,2,1,1,2,2018543,https://x,Sunny flat,,quiet,14.0,,,,domain,28,,\n";
        let cache = HistoryCache::from_csv_str(csv, today);
        assert_eq!(cache.len(), 1);

        let mut property = Property::new("2018543", PropertySource::Domain, today);
        let outcomes = cache.merge_into(&mut property);
        assert_eq!(property.description_en.as_deref(), Some("Sunny flat"));
        assert_eq!(property.average_score, Some(14.0));
        assert_eq!(property.commute_times.get(&School::Unsw).copied().flatten(), Some(28));
        assert!(outcomes.contains(&("description", ReuseOutcome::Reused)));
    }

    #[test]
    fn merge_into_never_overwrites_fresh_nonempty_value() {
        let today = Utc.with_ymd_and_hms(2026, 7, 31, 0, 0, 0).unwrap();
        let csv = "pricePerWeek,addressLine1,addressLine2,bedroomCount,bathroomCount,parkingCount,propertyType,houseId,url,description_en,description_cn,keywords,average_score,available_date,published_at,thumbnail_url,source,commuteTime_UNSW,commuteTime_USYD,commuteTime_UTS\n\
750,3/12 High St,kensington-nsw-2033,2,1,1,2,2018543,https://x,Old desc,,quiet,14.0,,,,domain,28,,\n";
        let cache = HistoryCache::from_csv_str(csv, today);

        let mut property = Property::new("2018543", PropertySource::Domain, today);
        property.description_en = Some("Fresh description".to_string());
        cache.merge_into(&mut property);
        assert_eq!(property.description_en.as_deref(), Some("Fresh description"));
    }
}
