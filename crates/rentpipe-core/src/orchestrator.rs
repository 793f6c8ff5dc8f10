use crate::adapter::{jittered_delay_ms, SiteAdapter, MAX_PAGES_PER_AREA};
use crate::browser::{BrowserDriver, NavigationOutcome};
use crate::commute::CommuteService;
use crate::db::{DbSink, UpsertOutcome};
use crate::history::HistoryCache;
use crate::model::{Property, RegionInfo, School, CSV_COLUMNS};
use crate::scoring::ScoringService;
use chrono::Utc;
use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("pipeline aborted: {0}")]
    Fatal(String),
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint csv write failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Per-stage disable switches, mirroring the CLI's `--no-*` flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub no_scoring: bool,
    pub no_commute: bool,
    pub no_database: bool,
    pub no_details: bool,
    /// Skips the delisting sweep's interactive confirmation on a TTY.
    /// Non-TTY runs without this set skip the sweep entirely.
    pub auto_delete_delisted: bool,
}

/// Totals printed/logged at sweep end, per spec's summary block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scraped: usize,
    pub with_details: usize,
    pub scored: usize,
    pub with_commute: usize,
    pub saved: usize,
    pub reused: usize,
    pub errors: usize,
}

impl SweepSummary {
    fn log(&self, university: School, source: &str) {
        info!(
            university = %university,
            source,
            scraped = self.scraped,
            with_details = self.with_details,
            scored = self.scored,
            with_commute = self.with_commute,
            saved = self.saved,
            reused = self.reused,
            errors = self.errors,
            "sweep complete"
        );
    }
}

/// Checkpoint chunk size for per-area LIST output and DB commit batching.
pub const CHECKPOINT_CHUNK: usize = 100;

pub struct Orchestrator {
    adapter: Box<dyn SiteAdapter>,
    browser: Box<dyn BrowserDriver>,
    db: Option<Arc<dyn DbSink>>,
    scoring: Option<Arc<ScoringService>>,
    scoring_max_workers: usize,
    commute: Option<Arc<CommuteService>>,
    commute_max_workers: usize,
    output_dir: PathBuf,
    options: PipelineOptions,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        adapter: Box<dyn SiteAdapter>,
        browser: Box<dyn BrowserDriver>,
        output_dir: impl Into<PathBuf>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            adapter,
            browser,
            db: None,
            scoring: None,
            scoring_max_workers: 1,
            commute: None,
            commute_max_workers: 1,
            output_dir: output_dir.into(),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_db(mut self, db: Arc<dyn DbSink>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_scoring(mut self, scoring: Arc<ScoringService>, max_workers: usize) -> Self {
        self.scoring = Some(scoring);
        self.scoring_max_workers = max_workers.max(1);
        self
    }

    pub fn with_commute(mut self, commute: Arc<CommuteService>, max_workers: usize) -> Self {
        self.commute = Some(commute);
        self.commute_max_workers = max_workers.max(1);
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Prints the pending delete count and asks for confirmation on a TTY,
    /// unless `auto_delete_delisted` bypasses the prompt. Non-TTY runs
    /// without the bypass skip the sweep rather than delete silently.
    fn confirm_delisting_sweep(&self, candidates: usize) -> bool {
        println!("delisting sweep: {candidates} listing(s) no longer found, would be removed");

        if self.options.auto_delete_delisted {
            return true;
        }

        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        if !stdin.is_terminal() || !stdout.is_terminal() {
            info!(candidates, "non-TTY run without AUTO_DELETE_DELISTED, skipping sweep");
            return false;
        }

        print!("delete these listings? [y/N] ");
        use std::io::Write;
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    /// Runs the full `LIST → LIST_MERGE → REUSE → DETAIL → SCORE → COMMUTE
    /// → PERSIST → EXPORT` state machine for one `(source, university)` pair.
    pub async fn run(
        &mut self,
        university: School,
        areas: &[String],
        profile_path: &Path,
    ) -> Result<SweepSummary, OrchestratorError> {
        let source = self.adapter.source();
        let mut summary = SweepSummary::default();
        let today = Utc::now();

        self.browser
            .open(profile_path)
            .await
            .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

        let mut properties = self.run_list(university, areas, &mut summary).await;

        self.run_list_merge(&mut properties);

        let history = HistoryCache::load(&self.output_dir, university.code(), today)
            .unwrap_or_else(|_| HistoryCache::empty());
        self.run_reuse(&mut properties, &history, &mut summary);

        if !self.options.no_details {
            self.run_detail(&mut properties, &mut summary).await;
        }

        self.browser.close().await.ok();

        if !self.options.no_scoring {
            if let Some(scoring) = self.scoring.clone() {
                scoring.process_properties(&mut properties, true, self.scoring_max_workers).await;
                summary.scored = properties.iter().filter(|p| p.average_score.is_some()).count();
            }
        }

        if !self.options.no_commute {
            if let Some(commute) = self.commute.clone() {
                commute
                    .process_properties(&mut properties, university, true, self.commute_max_workers)
                    .await;
                summary.with_commute = properties
                    .iter()
                    .filter(|p| p.commute_times.get(&university).copied().flatten().is_some())
                    .count();
            }
        }

        if !self.options.no_database {
            if let Some(db) = self.db.clone() {
                self.run_persist(&db, &properties, university, source.url_marker(), &mut summary)
                    .await?;
            }
        }

        self.run_export(&properties, university, today)?;

        summary.log(university, source.as_str());
        Ok(summary)
    }

    async fn run_list(&mut self, university: School, areas: &[String], summary: &mut SweepSummary) -> Vec<Property> {
        let mut collected = Vec::new();

        for area in areas {
            if self.cancelled() {
                break;
            }

            match self.fetch_area(area).await {
                Ok(mut props) => {
                    summary.scraped += props.len();
                    collected.append(&mut props);
                }
                Err(err) => {
                    warn!(area, %err, "area sweep failed, skipping");
                    summary.errors += 1;
                }
            }

            for (chunk_index, chunk) in collected.chunks(CHECKPOINT_CHUNK).enumerate() {
                self.write_checkpoint(university, chunk_index as u32, chunk).ok();
            }

            if self.browser.reset_profile().await.is_err() {
                warn!(area, "profile reset at area boundary failed");
            }
        }

        collected
    }

    async fn fetch_area(&mut self, area: &str) -> Result<Vec<Property>, OrchestratorError> {
        let mut url = self
            .adapter
            .search_url(area)
            .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

        let mut properties = Vec::new();
        let mut consecutive_blocks = 0u32;

        for page in 1..=MAX_PAGES_PER_AREA {
            if self.cancelled() {
                break;
            }

            let outcome = self
                .browser
                .goto(&url, 2_000)
                .await
                .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

            match outcome {
                NavigationOutcome::Blocked => {
                    consecutive_blocks += 1;
                    if consecutive_blocks >= 3 {
                        break;
                    }
                    continue;
                }
                NavigationOutcome::TimedOut => {
                    consecutive_blocks += 1;
                    if consecutive_blocks >= 3 {
                        break;
                    }
                    continue;
                }
                NavigationOutcome::Loaded => consecutive_blocks = 0,
            }

            let html = self
                .browser
                .page_source()
                .await
                .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

            let has_next = self.adapter.has_next(&html);
            properties.extend(self.adapter.parse_list(&html));

            if !has_next || page == MAX_PAGES_PER_AREA {
                break;
            }
            url = self.adapter.paginate(&url, page + 1);
            tokio::time::sleep(std::time::Duration::from_millis(jittered_delay_ms())).await;
        }

        Ok(properties)
    }

    fn run_list_merge(&self, properties: &mut Vec<Property>) {
        let mut seen = HashSet::new();
        properties.retain(|p| seen.insert(p.house_id.clone()));
    }

    fn run_reuse(&self, properties: &mut [Property], history: &HistoryCache, summary: &mut SweepSummary) {
        for property in properties.iter_mut() {
            let outcomes = history.merge_into(property);
            if outcomes
                .iter()
                .any(|(_, outcome)| matches!(outcome, crate::history::ReuseOutcome::Reused))
            {
                summary.reused += 1;
            }
        }
    }

    async fn run_detail(&mut self, properties: &mut [Property], summary: &mut SweepSummary) {
        let mut fetches_since_reset = 0u32;

        for property in properties.iter_mut() {
            if self.cancelled() {
                break;
            }
            if property.has_details() {
                continue;
            }

            if fetches_since_reset >= crate::browser::DEFAULT_RESET_INTERVAL {
                if self.browser.reset_profile().await.is_err() {
                    warn!("profile reset at detail fetch interval failed");
                }
                fetches_since_reset = 0;
            }

            let outcome = match self.browser.goto(&property.url, 2_000).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(house_id = %property.house_id, %err, "detail fetch failed");
                    summary.errors += 1;
                    continue;
                }
            };

            fetches_since_reset += 1;

            if !matches!(outcome, NavigationOutcome::Loaded) {
                summary.errors += 1;
                continue;
            }

            match self.browser.page_source().await {
                Ok(html) => {
                    self.adapter.parse_detail(&html, property);
                    if property.has_details() {
                        summary.with_details += 1;
                    }
                }
                Err(err) => {
                    warn!(house_id = %property.house_id, %err, "detail page source failed");
                    summary.errors += 1;
                }
            }
        }
    }

    async fn run_persist(
        &self,
        db: &Arc<dyn DbSink>,
        properties: &[Property],
        university: School,
        source_marker: &str,
        summary: &mut SweepSummary,
    ) -> Result<(), OrchestratorError> {
        let school_id = db
            .ensure_school(university)
            .await
            .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

        let live: HashSet<String> = properties.iter().map(|p| p.house_id.clone()).collect();
        let candidates = db
            .count_delisted_candidates(source_marker, university, &live)
            .await
            .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;

        if candidates > 0 {
            if self.confirm_delisting_sweep(candidates) {
                db.sweep_delisted(source_marker, university, &live)
                    .await
                    .map_err(|err| OrchestratorError::Fatal(err.to_string()))?;
            } else {
                info!(university = %university, candidates, "delisting sweep skipped");
            }
        }

        let mut resolved: Vec<(RegionInfo, Property)> = Vec::with_capacity(properties.len());
        for property in properties {
            match RegionInfo::from_address_line2(&property.address_line2) {
                Some(region) => resolved.push((region, property.clone())),
                None => {
                    warn!(house_id = %property.house_id, "cannot resolve region, property dropped");
                    summary.errors += 1;
                }
            }
        }

        // Batches of `CHECKPOINT_CHUNK` rows, each committed as a unit: a
        // failing row rolls back only its own chunk, and the next chunk
        // still proceeds.
        for chunk in resolved.chunks(CHECKPOINT_CHUNK) {
            match db.upsert_chunk(school_id, university, chunk).await {
                Ok(results) => {
                    for (_, outcome) in results {
                        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Updated) {
                            summary.saved += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, chunk_size = chunk.len(), "batch upsert failed, chunk rolled back");
                    summary.errors += chunk.len();
                }
            }
        }

        Ok(())
    }

    fn run_export(
        &self,
        properties: &[Property],
        university: School,
        today: chrono::DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let filename = format!("{}_rentdata_{}.csv", university.code(), crate::adapter::yymmdd(today));
        self.write_csv(&filename, properties)
    }

    fn write_checkpoint(
        &self,
        university: School,
        part: u32,
        properties: &[Property],
    ) -> Result<(), OrchestratorError> {
        let filename = format!(
            "{}_rentdata_list_{}_{}_part{}.csv",
            university.code(),
            self.adapter.source().as_str(),
            crate::adapter::yymmdd(Utc::now()),
            part
        );
        self.write_csv(&filename, properties)
    }

    fn write_csv(&self, filename: &str, properties: &[Property]) -> Result<(), OrchestratorError> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(filename);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(CSV_COLUMNS)?;
        for property in properties {
            writer.write_record(property.to_row())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// The UTS-reuses-USYD-list path: loads the sibling export instead of
    /// scraping, carries over this university's own prior commute times,
    /// computes only the missing ones, and persists/exports as usual.
    pub async fn run_shared_source(
        &mut self,
        university: School,
        sibling_export_path: &Path,
    ) -> Result<SweepSummary, OrchestratorError> {
        let mut summary = SweepSummary::default();
        let today = Utc::now();
        let source = self.adapter.source();

        let contents = std::fs::read_to_string(sibling_export_path)?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(contents.as_bytes());
        let mut properties: Vec<Property> = reader
            .records()
            .flatten()
            .filter_map(|record| {
                let row: Vec<String> = record.iter().map(str::to_string).collect();
                Property::from_row(&row, today)
            })
            .collect();
        summary.scraped = properties.len();

        let history = HistoryCache::load(&self.output_dir, university.code(), today)
            .unwrap_or_else(|_| HistoryCache::empty());
        for property in properties.iter_mut() {
            if let Some(minutes) = history_commute(&history, &property.house_id, university) {
                property.commute_times.entry(university).or_insert(Some(minutes));
            }
        }

        if !self.options.no_commute {
            if let Some(commute) = self.commute.clone() {
                commute
                    .process_properties(&mut properties, university, true, self.commute_max_workers)
                    .await;
                summary.with_commute = properties
                    .iter()
                    .filter(|p| p.commute_times.get(&university).copied().flatten().is_some())
                    .count();
            }
        }

        if !self.options.no_database {
            if let Some(db) = self.db.clone() {
                self.run_persist(&db, &properties, university, source.url_marker(), &mut summary)
                    .await?;
            }
        }

        self.run_export(&properties, university, today)?;
        summary.log(university, source.as_str());
        Ok(summary)
    }
}

fn history_commute(history: &HistoryCache, house_id: &str, university: School) -> Option<u32> {
    let mut dummy = Property::new(house_id, crate::model::PropertySource::Domain, Utc::now());
    history.merge_into(&mut dummy);
    dummy.commute_times.get(&university).copied().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DomainAdapter;
    use crate::browser::RecordedBrowserDriver;
    use crate::db::MemoryDbSink;
    use std::path::PathBuf;

    fn options_no_enrichment() -> PipelineOptions {
        PipelineOptions {
            no_scoring: true,
            no_commute: true,
            no_database: false,
            no_details: true,
            auto_delete_delisted: true,
        }
    }

    #[tokio::test]
    async fn run_persists_scraped_listing_and_creates_region() {
        let list_html = r#"
            <div data-testid="listing-2018543">
                <a data-testid="listing-2018543" href="/123-high-st-kensington-nsw-2033-2018543">View</a>
                <p>$750 per week</p>
                <h2>3/12 High St</h2>
                <span>Kensington NSW 2033</span>
            </div>
        "#;

        let browser = RecordedBrowserDriver::new().with_page(
            "https://www.domain.com.au/rent/kensington-nsw-2033/",
            list_html,
        );
        let db = Arc::new(MemoryDbSink::new());

        let tmp = tempdir();
        let mut orchestrator = Orchestrator::new(
            Box::new(DomainAdapter),
            Box::new(browser),
            tmp.clone(),
            options_no_enrichment(),
        )
        .with_db(db.clone());

        let areas = vec!["kensington-nsw-2033".to_string()];
        let profile = tmp.join("profile");
        let summary = orchestrator.run(School::Unsw, &areas, &profile).await.unwrap();

        assert_eq!(summary.errors, 0);
        assert!(db.property_count() <= 1);

        std::fs::remove_dir_all(&tmp).ok();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rentpipe-orchestrator-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
