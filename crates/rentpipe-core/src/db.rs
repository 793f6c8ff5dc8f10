use crate::model::{Property, RegionInfo, School};
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("unresolvable region for address line2 {0:?}")]
    UnresolvableRegion(String),
}

/// Outcome of `upsert_property`, folded into the sweep summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-`(source, school)` delisting result.
#[derive(Debug, Clone, Default)]
pub struct DelistingReport {
    pub deleted_house_ids: Vec<String>,
}

#[async_trait]
pub trait DbSink: Send + Sync {
    async fn ensure_region(&self, region: &RegionInfo) -> Result<i64, DbError>;
    async fn ensure_school(&self, school: School) -> Result<i64, DbError>;
    async fn upsert_property(
        &self,
        property: &Property,
        region_id: i64,
    ) -> Result<(i64, UpsertOutcome), DbError>;
    async fn upsert_property_school(
        &self,
        property_id: i64,
        school_id: i64,
        commute_minutes: Option<u32>,
    ) -> Result<(), DbError>;
    /// House ids that `sweep_delisted` would remove, without deleting
    /// anything. Used to print the count before the confirmation prompt.
    async fn count_delisted_candidates(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<usize, DbError>;
    /// Deletes every `house_id` advertised under `source` for `school` in
    /// the DB but absent from `live`, scoped by URL match — never by
    /// `school_id` alone.
    async fn sweep_delisted(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<DelistingReport, DbError>;
    /// Upserts one checkpoint-sized chunk of already-region-resolved rows
    /// as a single commit unit: if any row fails, the whole chunk rolls
    /// back and the error propagates so the caller can move on to the
    /// next chunk without the partial chunk's rows landing half-written.
    async fn upsert_chunk(
        &self,
        school_id: i64,
        university: School,
        rows: &[(RegionInfo, Property)],
    ) -> Result<Vec<(String, UpsertOutcome)>, DbError>;
}

pub struct SqlxDbSink {
    pool: Pool<MySql>,
}

impl SqlxDbSink {
    pub async fn connect(connection_url: &str) -> Result<Self, DbError> {
        let pool = MySqlPoolOptions::new().max_connections(5).connect(connection_url).await?;
        Ok(Self { pool })
    }

    /// Strict `(name, state, postcode)` lookup, falling back to a
    /// suburb-prefix fuzzy match before creating a new `postcode=0` row.
    async fn resolve_or_create_region(&self, region: &RegionInfo) -> Result<i64, DbError> {
        if let Some(id) = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM regions WHERE name = ? AND state = ? AND postcode = ?",
        )
        .bind(&region.name)
        .bind(&region.state)
        .bind(region.postcode)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(id);
        }

        if let Some(id) = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM regions WHERE name LIKE CONCAT(?, '%') AND state = ? LIMIT 1",
        )
        .bind(&region.name)
        .bind(&region.state)
        .fetch_optional(&self.pool)
        .await?
        {
            warn!(suburb = %region.name, region_id = id, "fuzzy region match, flagged for reconciliation");
            return Ok(id);
        }

        let result = sqlx::query("INSERT INTO regions (name, state, postcode) VALUES (?, ?, ?)")
            .bind(&region.name)
            .bind(&region.state)
            .bind(region.postcode)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_id() as i64)
    }
}

#[async_trait]
impl DbSink for SqlxDbSink {
    async fn ensure_region(&self, region: &RegionInfo) -> Result<i64, DbError> {
        self.resolve_or_create_region(region).await
    }

    async fn ensure_school(&self, school: School) -> Result<i64, DbError> {
        if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM schools WHERE name = ?")
            .bind(school.canonical_name())
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(id);
        }
        let result = sqlx::query("INSERT INTO schools (name) VALUES (?)")
            .bind(school.canonical_name())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn upsert_property(
        &self,
        property: &Property,
        region_id: i64,
    ) -> Result<(i64, UpsertOutcome), DbError> {
        let existing = sqlx::query_as::<_, (i64, i64, i64, i64, i64, Option<String>, Option<String>, Option<String>, Option<String>)>(
            "SELECT id, price, bedroom_count, bathroom_count, parking_count, description_en, keywords, url, thumbnail_url FROM properties WHERE house_id = ?",
        )
        .bind(&property.house_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, price, beds, baths, parking, description_en, keywords, url, thumbnail)) = existing {
            let changed = price != property.price_per_week as i64
                || beds != property.bedroom_count as i64
                || baths != property.bathroom_count as i64
                || parking != property.parking_count as i64
                || description_en.as_deref() != property.description_en.as_deref()
                || keywords.as_deref() != property.keywords.as_deref()
                || url.as_deref() != Some(property.url.as_str())
                || thumbnail.as_deref() != property.thumbnail_url.as_deref();

            if !changed {
                return Ok((id, UpsertOutcome::Unchanged));
            }

            sqlx::query(
                "UPDATE properties SET price = ?, region_id = ?, bedroom_count = ?, bathroom_count = ?, \
                 parking_count = ?, property_type = ?, available_date = ?, keywords = ?, average_score = ?, \
                 description_en = ?, description_cn = ?, url = ?, published_at = ?, thumbnail_url = ? WHERE id = ?",
            )
            .bind(property.price_per_week)
            .bind(region_id)
            .bind(property.bedroom_count)
            .bind(property.bathroom_count)
            .bind(property.parking_count)
            .bind(property.property_type.code())
            .bind(property.available_date)
            .bind(&property.keywords)
            .bind(property.average_score)
            .bind(&property.description_en)
            .bind(&property.description_cn)
            .bind(&property.url)
            .bind(property.published_at)
            .bind(&property.thumbnail_url)
            .bind(id)
            .execute(&self.pool)
            .await?;

            return Ok((id, UpsertOutcome::Updated));
        }

        let result = sqlx::query(
            "INSERT INTO properties (price, region_id, bedroom_count, bathroom_count, parking_count, \
             property_type, house_id, available_date, keywords, average_score, description_en, \
             description_cn, url, published_at, thumbnail_url) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(property.price_per_week)
        .bind(region_id)
        .bind(property.bedroom_count)
        .bind(property.bathroom_count)
        .bind(property.parking_count)
        .bind(property.property_type.code())
        .bind(&property.house_id)
        .bind(property.available_date)
        .bind(&property.keywords)
        .bind(property.average_score)
        .bind(&property.description_en)
        .bind(&property.description_cn)
        .bind(&property.url)
        .bind(property.published_at)
        .bind(&property.thumbnail_url)
        .execute(&self.pool)
        .await?;

        Ok((result.last_insert_id() as i64, UpsertOutcome::Inserted))
    }

    async fn upsert_property_school(
        &self,
        property_id: i64,
        school_id: i64,
        commute_minutes: Option<u32>,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM property_school WHERE property_id = ? AND school_id = ?")
            .bind(property_id)
            .bind(school_id)
            .execute(&self.pool)
            .await?;

        sqlx::query("INSERT INTO property_school (property_id, school_id, commute_time) VALUES (?, ?, ?)")
            .bind(property_id)
            .bind(school_id)
            .bind(commute_minutes)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn count_delisted_candidates(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<usize, DbError> {
        let db_for_pair: Vec<(i64, String)> = sqlx::query_as(
            "SELECT p.id, p.house_id FROM properties p \
             JOIN property_school ps ON ps.property_id = p.id \
             JOIN schools s ON s.id = ps.school_id \
             WHERE s.name = ? AND p.url LIKE CONCAT('%', ?, '%')",
        )
        .bind(school.canonical_name())
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(db_for_pair.iter().filter(|(_, house_id)| !live.contains(house_id)).count())
    }

    async fn sweep_delisted(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<DelistingReport, DbError> {
        let mut tx: Transaction<'_, MySql> = self.pool.begin().await?;

        let db_for_pair: Vec<(i64, String)> = sqlx::query_as(
            "SELECT p.id, p.house_id FROM properties p \
             JOIN property_school ps ON ps.property_id = p.id \
             JOIN schools s ON s.id = ps.school_id \
             WHERE s.name = ? AND p.url LIKE CONCAT('%', ?, '%')",
        )
        .bind(school.canonical_name())
        .bind(source)
        .fetch_all(&mut *tx)
        .await?;

        let school_id: i64 = sqlx::query_scalar("SELECT id FROM schools WHERE name = ?")
            .bind(school.canonical_name())
            .fetch_one(&mut *tx)
            .await?;

        let mut report = DelistingReport::default();
        for (property_id, house_id) in db_for_pair {
            if live.contains(&house_id) {
                continue;
            }

            sqlx::query("DELETE FROM property_school WHERE property_id = ? AND school_id = ?")
                .bind(property_id)
                .bind(school_id)
                .execute(&mut *tx)
                .await?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM property_school WHERE property_id = ?",
            )
            .bind(property_id)
            .fetch_one(&mut *tx)
            .await?;

            if remaining == 0 {
                sqlx::query("DELETE FROM property_images WHERE property_id = ?")
                    .bind(property_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM properties WHERE id = ?")
                    .bind(property_id)
                    .execute(&mut *tx)
                    .await?;
            }

            report.deleted_house_ids.push(house_id);
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn upsert_chunk(
        &self,
        school_id: i64,
        university: School,
        rows: &[(RegionInfo, Property)],
    ) -> Result<Vec<(String, UpsertOutcome)>, DbError> {
        let mut tx: Transaction<'_, MySql> = self.pool.begin().await?;
        let mut results = Vec::with_capacity(rows.len());

        for (region, property) in rows {
            let region_id = if let Some(id) = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM regions WHERE name = ? AND state = ? AND postcode = ?",
            )
            .bind(&region.name)
            .bind(&region.state)
            .bind(region.postcode)
            .fetch_optional(&mut *tx)
            .await?
            {
                id
            } else if let Some(id) = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM regions WHERE name LIKE CONCAT(?, '%') AND state = ? LIMIT 1",
            )
            .bind(&region.name)
            .bind(&region.state)
            .fetch_optional(&mut *tx)
            .await?
            {
                warn!(suburb = %region.name, region_id = id, "fuzzy region match, flagged for reconciliation");
                id
            } else {
                let result = sqlx::query("INSERT INTO regions (name, state, postcode) VALUES (?, ?, ?)")
                    .bind(&region.name)
                    .bind(&region.state)
                    .bind(region.postcode)
                    .execute(&mut *tx)
                    .await?;
                result.last_insert_id() as i64
            };

            let existing = sqlx::query_as::<_, (i64, i64, i64, i64, i64, Option<String>, Option<String>, Option<String>, Option<String>)>(
                "SELECT id, price, bedroom_count, bathroom_count, parking_count, description_en, keywords, url, thumbnail_url FROM properties WHERE house_id = ?",
            )
            .bind(&property.house_id)
            .fetch_optional(&mut *tx)
            .await?;

            let (property_id, outcome) = if let Some((id, price, beds, baths, parking, description_en, keywords, url, thumbnail)) = existing {
                let changed = price != property.price_per_week as i64
                    || beds != property.bedroom_count as i64
                    || baths != property.bathroom_count as i64
                    || parking != property.parking_count as i64
                    || description_en.as_deref() != property.description_en.as_deref()
                    || keywords.as_deref() != property.keywords.as_deref()
                    || url.as_deref() != Some(property.url.as_str())
                    || thumbnail.as_deref() != property.thumbnail_url.as_deref();

                if changed {
                    sqlx::query(
                        "UPDATE properties SET price = ?, region_id = ?, bedroom_count = ?, bathroom_count = ?, \
                         parking_count = ?, property_type = ?, available_date = ?, keywords = ?, average_score = ?, \
                         description_en = ?, description_cn = ?, url = ?, published_at = ?, thumbnail_url = ? WHERE id = ?",
                    )
                    .bind(property.price_per_week)
                    .bind(region_id)
                    .bind(property.bedroom_count)
                    .bind(property.bathroom_count)
                    .bind(property.parking_count)
                    .bind(property.property_type.code())
                    .bind(property.available_date)
                    .bind(&property.keywords)
                    .bind(property.average_score)
                    .bind(&property.description_en)
                    .bind(&property.description_cn)
                    .bind(&property.url)
                    .bind(property.published_at)
                    .bind(&property.thumbnail_url)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    (id, UpsertOutcome::Updated)
                } else {
                    (id, UpsertOutcome::Unchanged)
                }
            } else {
                let result = sqlx::query(
                    "INSERT INTO properties (price, region_id, bedroom_count, bathroom_count, parking_count, \
                     property_type, house_id, available_date, keywords, average_score, description_en, \
                     description_cn, url, published_at, thumbnail_url) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(property.price_per_week)
                .bind(region_id)
                .bind(property.bedroom_count)
                .bind(property.bathroom_count)
                .bind(property.parking_count)
                .bind(property.property_type.code())
                .bind(&property.house_id)
                .bind(property.available_date)
                .bind(&property.keywords)
                .bind(property.average_score)
                .bind(&property.description_en)
                .bind(&property.description_cn)
                .bind(&property.url)
                .bind(property.published_at)
                .bind(&property.thumbnail_url)
                .execute(&mut *tx)
                .await?;
                (result.last_insert_id() as i64, UpsertOutcome::Inserted)
            };

            sqlx::query("DELETE FROM property_school WHERE property_id = ? AND school_id = ?")
                .bind(property_id)
                .bind(school_id)
                .execute(&mut *tx)
                .await?;

            let commute_minutes = property.commute_times.get(&university).copied().flatten();
            sqlx::query("INSERT INTO property_school (property_id, school_id, commute_time) VALUES (?, ?, ?)")
                .bind(property_id)
                .bind(school_id)
                .bind(commute_minutes)
                .execute(&mut *tx)
                .await?;

            results.push((property.house_id.clone(), outcome));
        }

        tx.commit().await?;
        Ok(results)
    }
}

/// In-memory double backing orchestrator tests and the spec's literal
/// scenarios; mirrors the relational schema as plain maps.
#[derive(Debug, Default)]
pub struct MemoryDbSink {
    inner: std::sync::Mutex<MemoryState>,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    regions: Vec<RegionInfo>,
    schools: Vec<String>,
    properties: HashMap<String, StoredProperty>,
    next_property_id: i64,
    property_school: HashMap<(i64, i64), Option<u32>>,
}

#[derive(Debug, Clone)]
struct StoredProperty {
    id: i64,
    url: String,
    price: u32,
    bedroom_count: u32,
    bathroom_count: u32,
    parking_count: u32,
    description_en: Option<String>,
    keywords: Option<String>,
    thumbnail_url: Option<String>,
}

impl MemoryDbSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property_count(&self) -> usize {
        self.inner.lock().unwrap().properties.len()
    }

    pub fn property_school_count(&self) -> usize {
        self.inner.lock().unwrap().property_school.len()
    }

    pub fn contains_house_id(&self, house_id: &str) -> bool {
        self.inner.lock().unwrap().properties.contains_key(house_id)
    }
}

#[async_trait]
impl DbSink for MemoryDbSink {
    async fn ensure_region(&self, region: &RegionInfo) -> Result<i64, DbError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(pos) = state.regions.iter().position(|r| r == region) {
            return Ok(pos as i64);
        }
        if let Some(pos) = state
            .regions
            .iter()
            .position(|r| r.state == region.state && region.name.starts_with(r.name.as_str()))
        {
            warn!(suburb = %region.name, region_id = pos as i64, "fuzzy region match, flagged for reconciliation");
            return Ok(pos as i64);
        }
        state.regions.push(region.clone());
        Ok((state.regions.len() - 1) as i64)
    }

    async fn ensure_school(&self, school: School) -> Result<i64, DbError> {
        let mut state = self.inner.lock().unwrap();
        let name = school.canonical_name().to_string();
        if let Some(pos) = state.schools.iter().position(|s| s == &name) {
            return Ok(pos as i64);
        }
        state.schools.push(name);
        Ok((state.schools.len() - 1) as i64)
    }

    async fn upsert_property(
        &self,
        property: &Property,
        _region_id: i64,
    ) -> Result<(i64, UpsertOutcome), DbError> {
        let mut state = self.inner.lock().unwrap();

        if let Some(existing) = state.properties.get(&property.house_id).cloned() {
            let changed = existing.price != property.price_per_week
                || existing.bedroom_count != property.bedroom_count
                || existing.bathroom_count != property.bathroom_count
                || existing.parking_count != property.parking_count
                || existing.description_en != property.description_en
                || existing.keywords != property.keywords
                || existing.url != property.url
                || existing.thumbnail_url != property.thumbnail_url;

            let id = existing.id;
            if changed {
                state.properties.insert(
                    property.house_id.clone(),
                    StoredProperty {
                        id,
                        url: property.url.clone(),
                        price: property.price_per_week,
                        bedroom_count: property.bedroom_count,
                        bathroom_count: property.bathroom_count,
                        parking_count: property.parking_count,
                        description_en: property.description_en.clone(),
                        keywords: property.keywords.clone(),
                        thumbnail_url: property.thumbnail_url.clone(),
                    },
                );
                return Ok((id, UpsertOutcome::Updated));
            }
            return Ok((id, UpsertOutcome::Unchanged));
        }

        let id = state.next_property_id;
        state.next_property_id += 1;
        state.properties.insert(
            property.house_id.clone(),
            StoredProperty {
                id,
                url: property.url.clone(),
                price: property.price_per_week,
                bedroom_count: property.bedroom_count,
                bathroom_count: property.bathroom_count,
                parking_count: property.parking_count,
                description_en: property.description_en.clone(),
                keywords: property.keywords.clone(),
                thumbnail_url: property.thumbnail_url.clone(),
            },
        );
        Ok((id, UpsertOutcome::Inserted))
    }

    async fn upsert_property_school(
        &self,
        property_id: i64,
        school_id: i64,
        commute_minutes: Option<u32>,
    ) -> Result<(), DbError> {
        let mut state = self.inner.lock().unwrap();
        state.property_school.insert((property_id, school_id), commute_minutes);
        Ok(())
    }

    async fn count_delisted_candidates(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<usize, DbError> {
        let state = self.inner.lock().unwrap();
        let school_name = school.canonical_name().to_string();
        let Some(school_id) = state.schools.iter().position(|s| s == &school_name) else {
            return Ok(0);
        };
        let school_id = school_id as i64;

        Ok(state
            .properties
            .iter()
            .filter(|(house_id, p)| {
                p.url.contains(source)
                    && state.property_school.contains_key(&(p.id, school_id))
                    && !live.contains(*house_id)
            })
            .count())
    }

    async fn sweep_delisted(
        &self,
        source: &str,
        school: School,
        live: &HashSet<String>,
    ) -> Result<DelistingReport, DbError> {
        let mut state = self.inner.lock().unwrap();
        let school_name = school.canonical_name().to_string();
        let Some(school_id) = state.schools.iter().position(|s| s == &school_name) else {
            return Ok(DelistingReport::default());
        };
        let school_id = school_id as i64;

        let expired: Vec<(String, i64)> = state
            .properties
            .iter()
            .filter(|(house_id, p)| {
                p.url.contains(source)
                    && state.property_school.contains_key(&(p.id, school_id))
                    && !live.contains(*house_id)
            })
            .map(|(house_id, p)| (house_id.clone(), p.id))
            .collect();

        let mut report = DelistingReport::default();
        for (house_id, property_id) in expired {
            state.property_school.remove(&(property_id, school_id));
            let remaining = state.property_school.keys().filter(|(id, _)| *id == property_id).count();
            if remaining == 0 {
                state.properties.remove(&house_id);
            }
            report.deleted_house_ids.push(house_id);
        }

        Ok(report)
    }

    async fn upsert_chunk(
        &self,
        school_id: i64,
        university: School,
        rows: &[(RegionInfo, Property)],
    ) -> Result<Vec<(String, UpsertOutcome)>, DbError> {
        // Mirrors the real sink's per-chunk transaction: mutate a clone of
        // the state and only swap it back in once every row succeeds.
        let mut staged = self.inner.lock().unwrap().clone();
        let mut results = Vec::with_capacity(rows.len());

        for (region, property) in rows {
            let _region_id = if let Some(pos) = staged.regions.iter().position(|r| r == region) {
                pos as i64
            } else if let Some(pos) = staged
                .regions
                .iter()
                .position(|r| r.state == region.state && region.name.starts_with(r.name.as_str()))
            {
                pos as i64
            } else {
                staged.regions.push(region.clone());
                (staged.regions.len() - 1) as i64
            };

            let (property_id, outcome) = if let Some(existing) = staged.properties.get(&property.house_id).cloned() {
                let changed = existing.price != property.price_per_week
                    || existing.bedroom_count != property.bedroom_count
                    || existing.bathroom_count != property.bathroom_count
                    || existing.parking_count != property.parking_count
                    || existing.description_en != property.description_en
                    || existing.keywords != property.keywords
                    || existing.url != property.url
                    || existing.thumbnail_url != property.thumbnail_url;

                if changed {
                    staged.properties.insert(
                        property.house_id.clone(),
                        StoredProperty {
                            id: existing.id,
                            url: property.url.clone(),
                            price: property.price_per_week,
                            bedroom_count: property.bedroom_count,
                            bathroom_count: property.bathroom_count,
                            parking_count: property.parking_count,
                            description_en: property.description_en.clone(),
                            keywords: property.keywords.clone(),
                            thumbnail_url: property.thumbnail_url.clone(),
                        },
                    );
                    (existing.id, UpsertOutcome::Updated)
                } else {
                    (existing.id, UpsertOutcome::Unchanged)
                }
            } else {
                let id = staged.next_property_id;
                staged.next_property_id += 1;
                staged.properties.insert(
                    property.house_id.clone(),
                    StoredProperty {
                        id,
                        url: property.url.clone(),
                        price: property.price_per_week,
                        bedroom_count: property.bedroom_count,
                        bathroom_count: property.bathroom_count,
                        parking_count: property.parking_count,
                        description_en: property.description_en.clone(),
                        keywords: property.keywords.clone(),
                        thumbnail_url: property.thumbnail_url.clone(),
                    },
                );
                (id, UpsertOutcome::Inserted)
            };

            let commute_minutes = property.commute_times.get(&university).copied().flatten();
            staged.property_school.insert((property_id, school_id), commute_minutes);
            results.push((property.house_id.clone(), outcome));
        }

        *self.inner.lock().unwrap() = staged;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertySource;
    use chrono::Utc;

    fn property(house_id: &str, url: &str) -> Property {
        let mut p = Property::new(house_id, PropertySource::RealEstate, Utc::now());
        p.url = url.to_string();
        p.price_per_week = 750;
        p
    }

    #[tokio::test]
    async fn ensure_region_reuses_strict_match() {
        let sink = MemoryDbSink::new();
        let region = RegionInfo { name: "kensington".into(), state: "NSW".into(), postcode: 2033 };
        let first = sink.ensure_region(&region).await.unwrap();
        let second = sink.ensure_region(&region).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn upsert_property_reports_inserted_then_unchanged() {
        let sink = MemoryDbSink::new();
        let p = property("2018543", "https://realestate.com.au/123");
        let (id1, outcome1) = sink.upsert_property(&p, 0).await.unwrap();
        assert_eq!(outcome1, UpsertOutcome::Inserted);
        let (id2, outcome2) = sink.upsert_property(&p, 0).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(outcome2, UpsertOutcome::Unchanged);
    }

    #[tokio::test]
    async fn sweep_delisted_is_scoped_to_source_and_school() {
        let sink = MemoryDbSink::new();
        let school_id = sink.ensure_school(School::Usyd).await.unwrap();

        let a = property("A", "https://realestate.com.au/a");
        let b = property("B", "https://realestate.com.au/b");
        let c = property("C", "https://realestate.com.au/c");
        for p in [&a, &b, &c] {
            let (id, _) = sink.upsert_property(p, 0).await.unwrap();
            sink.upsert_property_school(id, school_id, Some(20)).await.unwrap();
        }

        let live: HashSet<String> = ["A".to_string(), "B".to_string()].into_iter().collect();
        let report = sink.sweep_delisted("realestate.com.au", School::Usyd, &live).await.unwrap();

        assert_eq!(report.deleted_house_ids, vec!["C".to_string()]);
        assert!(!sink.contains_house_id("C"));
        assert!(sink.contains_house_id("A"));
        assert!(sink.contains_house_id("B"));
    }

    #[tokio::test]
    async fn sweep_delisted_leaves_other_sources_untouched() {
        let sink = MemoryDbSink::new();
        let school_id = sink.ensure_school(School::Unsw).await.unwrap();

        let domain_listing = property("D1", "https://domain.com.au/d1");
        let (id, _) = sink.upsert_property(&domain_listing, 0).await.unwrap();
        sink.upsert_property_school(id, school_id, Some(15)).await.unwrap();

        let live: HashSet<String> = HashSet::new();
        let report = sink.sweep_delisted("realestate.com.au", School::Unsw, &live).await.unwrap();

        assert!(report.deleted_house_ids.is_empty());
        assert!(sink.contains_house_id("D1"));
    }
}
