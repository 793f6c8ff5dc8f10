use crate::model::{Property, School};
use async_trait::async_trait;
use chrono::{Local, NaiveTime, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Canonical addresses ported from the original's `SCHOOL_COORDINATES`
/// table, used as the destination string for the directions API.
pub fn school_address(school: School) -> &'static str {
    match school {
        School::Unsw => "University of New South Wales, Kensington NSW 2052, Australia",
        School::Usyd => "University of Sydney, Camperdown NSW 2006, Australia",
        School::Uts => "University of Technology Sydney, Ultimo NSW 2007, Australia",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommuteError {
    #[error("directions API request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait DirectionsGateway: Send + Sync {
    async fn transit_minutes(
        &self,
        origin: &str,
        destination: &str,
        departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError>;

    async fn driving_minutes(
        &self,
        origin: &str,
        destination: &str,
        departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError>;
}

/// Real gateway against the Google Maps Directions / Distance Matrix APIs.
pub struct GoogleMapsGateway {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleMapsGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into() }
    }
}

#[async_trait]
impl DirectionsGateway for GoogleMapsGateway {
    async fn transit_minutes(
        &self,
        origin: &str,
        destination: &str,
        departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError> {
        let response = self
            .client
            .get("https://maps.googleapis.com/maps/api/directions/json")
            .query(&[
                ("origin", origin),
                ("destination", destination),
                ("mode", "transit"),
                ("departure_time", &departure.timestamp().to_string()),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(|err| CommuteError::Request(err.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| CommuteError::Request(err.to_string()))?;

        let seconds = body["routes"][0]["legs"][0]["duration"]["value"].as_u64();
        Ok(seconds.map(|s| ((s as f64) / 60.0).round() as u32))
    }

    async fn driving_minutes(
        &self,
        origin: &str,
        destination: &str,
        departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError> {
        let response = self
            .client
            .get("https://maps.googleapis.com/maps/api/distancematrix/json")
            .query(&[
                ("origins", origin),
                ("destinations", destination),
                ("mode", "driving"),
                ("departure_time", &departure.timestamp().to_string()),
                ("traffic_model", "best_guess"),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(|err| CommuteError::Request(err.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| CommuteError::Request(err.to_string()))?;

        if body["status"] != "OK" {
            return Ok(None);
        }
        let element = &body["rows"][0]["elements"][0];
        if element["status"] != "OK" {
            return Ok(None);
        }
        let seconds = element["duration"]["value"].as_u64();
        Ok(seconds.map(|s| ((s as f64) / 60.0).round() as u32))
    }
}

/// Test double returning scripted minutes per origin/destination pair.
#[derive(Debug, Default)]
pub struct FakeDirectionsGateway {
    pub transit: std::collections::HashMap<(String, String), Option<u32>>,
    pub driving: std::collections::HashMap<(String, String), Option<u32>>,
    pub transit_calls: std::sync::Mutex<u32>,
    pub driving_calls: std::sync::Mutex<u32>,
}

impl FakeDirectionsGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transit(mut self, origin: &str, destination: &str, minutes: Option<u32>) -> Self {
        self.transit.insert((origin.to_string(), destination.to_string()), minutes);
        self
    }

    pub fn with_driving(mut self, origin: &str, destination: &str, minutes: Option<u32>) -> Self {
        self.driving.insert((origin.to_string(), destination.to_string()), minutes);
        self
    }
}

#[async_trait]
impl DirectionsGateway for FakeDirectionsGateway {
    async fn transit_minutes(
        &self,
        origin: &str,
        destination: &str,
        _departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError> {
        *self.transit_calls.lock().unwrap() += 1;
        Ok(self.transit.get(&(origin.to_string(), destination.to_string())).copied().flatten())
    }

    async fn driving_minutes(
        &self,
        origin: &str,
        destination: &str,
        _departure: chrono::DateTime<Local>,
    ) -> Result<Option<u32>, CommuteError> {
        *self.driving_calls.lock().unwrap() += 1;
        Ok(self.driving.get(&(origin.to_string(), destination.to_string())).copied().flatten())
    }
}

/// `addressLine1, addressLine2, Australia` with hyphens replaced by spaces.
pub fn commute_origin(property: &Property) -> String {
    let parts: Vec<String> = [&property.address_line1, &property.address_line2]
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.replace('-', " "))
        .collect();

    if parts.is_empty() {
        String::new()
    } else {
        format!("{}, Australia", parts.join(", "))
    }
}

/// 08:30 local time on the next calendar day, ported from
/// `calculate_transit_time`'s `datetime.now().replace(...) + timedelta(days=1)`.
pub fn next_departure_time() -> chrono::DateTime<Local> {
    let tomorrow = Local::now().date_naive() + chrono::Duration::days(1);
    Local
        .from_local_datetime(&tomorrow.and_time(NaiveTime::from_hms_opt(8, 30, 0).unwrap()))
        .single()
        .expect("unambiguous local time")
}

pub struct CommuteService {
    gateway: Arc<dyn DirectionsGateway>,
    request_delay: Duration,
}

impl CommuteService {
    pub fn new(gateway: Arc<dyn DirectionsGateway>, request_delay: Duration) -> Self {
        Self { gateway, request_delay }
    }

    /// Transit first, then driving × 1.5 rounded, then `None`.
    pub async fn calculate_commute_time(&self, property: &Property, school: School) -> Option<u32> {
        let origin = commute_origin(property);
        if origin.is_empty() {
            debug!(house_id = %property.house_id, "cannot build commute origin, skipping");
            return None;
        }
        resolve_commute_minutes(self.gateway.as_ref(), &origin, school).await
    }

    /// Processes one school across a batch with a bounded worker pool
    /// (default size 5, per `COMMUTE_MAX_WORKERS`), skipping properties
    /// that already carry a value when `skip_existing`. Mirrors
    /// `ScoringService::process_properties`'s chunked-spawn pattern.
    pub async fn process_properties(
        &self,
        properties: &mut [Property],
        school: School,
        skip_existing: bool,
        max_workers: usize,
    ) {
        let indices: Vec<usize> = properties
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                let existing = p.commute_times.get(&school).copied().flatten();
                !(skip_existing && existing.is_some())
            })
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            debug!("no properties require a commute lookup");
            return;
        }

        for chunk in indices.chunks(max_workers.max(1)) {
            let mut handles = Vec::new();
            for &idx in chunk {
                let origin = commute_origin(&properties[idx]);
                let house_id = properties[idx].house_id.clone();
                let gateway = self.gateway.clone();
                let request_delay = self.request_delay;
                handles.push((
                    idx,
                    tokio::spawn(async move {
                        tokio::time::sleep(request_delay).await;
                        if origin.is_empty() {
                            debug!(house_id = %house_id, "cannot build commute origin, skipping");
                            return None;
                        }
                        resolve_commute_minutes(gateway.as_ref(), &origin, school).await
                    }),
                ));
            }

            for (idx, handle) in handles {
                if let Ok(minutes) = handle.await {
                    properties[idx].commute_times.insert(school, minutes);
                }
            }
        }
    }
}

/// Transit first, then driving × 1.5 rounded, then `None`. Shared by the
/// single-property and worker-pool entry points.
async fn resolve_commute_minutes(gateway: &dyn DirectionsGateway, origin: &str, school: School) -> Option<u32> {
    let destination = school_address(school);
    let departure = next_departure_time();

    match gateway.transit_minutes(origin, destination, departure).await {
        Ok(Some(minutes)) if minutes > 0 => return Some(minutes),
        Ok(_) => {}
        Err(err) => warn!(%err, "transit query failed"),
    }

    match gateway.driving_minutes(origin, destination, departure).await {
        Ok(Some(minutes)) if minutes > 0 => Some(((minutes as f64) * 1.5).round() as u32),
        Ok(_) => None,
        Err(err) => {
            warn!(%err, "driving query failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertySource;

    fn property_with_address() -> Property {
        let mut p = Property::new("1", PropertySource::Domain, chrono::Utc::now());
        p.address_line1 = "3/12 High St".to_string();
        p.address_line2 = "kensington-nsw-2033".to_string();
        p
    }

    #[test]
    fn commute_origin_replaces_hyphens_and_appends_australia() {
        let property = property_with_address();
        assert_eq!(
            commute_origin(&property),
            "3/12 High St, kensington nsw 2033, Australia"
        );
    }

    #[test]
    fn commute_origin_empty_when_no_address() {
        let property = Property::new("1", PropertySource::Domain, chrono::Utc::now());
        assert_eq!(commute_origin(&property), "");
    }

    #[tokio::test]
    async fn calculate_commute_time_prefers_transit() {
        let property = property_with_address();
        let origin = commute_origin(&property);
        let destination = school_address(School::Unsw);
        let gateway = Arc::new(FakeDirectionsGateway::new().with_transit(&origin, destination, Some(28)));
        let service = CommuteService::new(gateway, Duration::from_millis(0));
        let minutes = service.calculate_commute_time(&property, School::Unsw).await;
        assert_eq!(minutes, Some(28));
    }

    #[tokio::test]
    async fn calculate_commute_time_falls_back_to_driving_times_1_5() {
        let property = property_with_address();
        let origin = commute_origin(&property);
        let destination = school_address(School::Unsw);
        let gateway = Arc::new(
            FakeDirectionsGateway::new()
                .with_transit(&origin, destination, None)
                .with_driving(&origin, destination, Some(20)),
        );
        let service = CommuteService::new(gateway, Duration::from_millis(0));
        let minutes = service.calculate_commute_time(&property, School::Unsw).await;
        assert_eq!(minutes, Some(30));
    }

    #[tokio::test]
    async fn calculate_commute_time_returns_none_on_double_failure() {
        let property = property_with_address();
        let gateway = Arc::new(FakeDirectionsGateway::new());
        let service = CommuteService::new(gateway, Duration::from_millis(0));
        let minutes = service.calculate_commute_time(&property, School::Unsw).await;
        assert_eq!(minutes, None);
    }

    #[tokio::test]
    async fn process_properties_skips_existing_when_enabled() {
        let mut property = property_with_address();
        property.commute_times.insert(School::Unsw, Some(15));
        let gateway = Arc::new(FakeDirectionsGateway::new());
        let service = CommuteService::new(gateway.clone(), Duration::from_millis(0));
        let mut batch = vec![property];
        service.process_properties(&mut batch, School::Unsw, true, 5).await;
        assert_eq!(batch[0].commute_times.get(&School::Unsw).copied().flatten(), Some(15));
        assert_eq!(*gateway.transit_calls.lock().unwrap(), 0);
    }
}
