use clap::{Args, Parser, Subcommand};
use rentpipe_core::adapter::{DomainAdapter, RealEstateAdapter};
use rentpipe_core::browser::ChromiumBrowserDriver;
use rentpipe_core::commute::{CommuteService, GoogleMapsGateway};
use rentpipe_core::db::SqlxDbSink;
use rentpipe_core::model::{PropertySource, School};
use rentpipe_core::orchestrator::{Orchestrator, PipelineOptions};
use rentpipe_core::scoring::{DashscopeGateway, ScoringService};
use rentpipe_core::{telemetry, AppConfig, AppError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rentpipe", about = "Rental-listing scraping and enrichment pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline for one or more universities.
    Run(RunArgs),
    /// Reprocess an existing checkpoint CSV without re-scraping.
    ProcessCsv(ProcessCsvArgs),
    /// Run only the LIST/DETAIL stages and write the raw CSV.
    ScrapeOnly(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Universities to sweep (e.g. UNSW USYD UTS).
    #[arg(long, value_delimiter = ' ', num_args = 1..)]
    universities: Vec<String>,
    /// Portal adapters to use (portal-d, portal-r).
    #[arg(long, value_delimiter = ' ', num_args = 1..)]
    scrapers: Vec<String>,
    #[arg(long)]
    no_scoring: bool,
    #[arg(long)]
    no_commute: bool,
    #[arg(long)]
    no_database: bool,
    #[arg(long)]
    no_details: bool,
    #[arg(long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct ProcessCsvArgs {
    /// Path to a checkpoint CSV to reprocess.
    #[arg(long)]
    input: PathBuf,
    /// University the checkpoint belongs to.
    #[arg(long)]
    university: String,
    #[arg(long)]
    no_scoring: bool,
    #[arg(long)]
    no_commute: bool,
    #[arg(long)]
    no_database: bool,
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_cli().await {
        eprintln!("application error: {err}");
        std::process::exit(1);
    }
}

async fn run_cli() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    match cli.command {
        Command::Run(args) => run_pipeline(&config, args, false).await,
        Command::ScrapeOnly(mut args) => {
            args.no_scoring = true;
            args.no_commute = true;
            args.no_database = true;
            run_pipeline(&config, args, true).await
        }
        Command::ProcessCsv(args) => run_process_csv(&config, args).await,
    }
}

fn pipeline_options(
    config: &AppConfig,
    no_scoring: bool,
    no_commute: bool,
    no_database: bool,
    no_details: bool,
) -> PipelineOptions {
    PipelineOptions {
        no_scoring,
        no_commute,
        no_database,
        no_details,
        auto_delete_delisted: config.auto_delete_delisted,
    }
}

async fn run_pipeline(config: &AppConfig, args: RunArgs, scrape_only: bool) -> Result<(), AppError> {
    let universities: Vec<School> = args
        .universities
        .iter()
        .filter_map(|code| School::parse(code))
        .collect();

    if universities.is_empty() {
        warn!("no valid universities supplied, nothing to do");
        return Ok(());
    }

    let sources: Vec<PropertySource> = if args.scrapers.is_empty() {
        vec![PropertySource::Domain, PropertySource::RealEstate]
    } else {
        args.scrapers
            .iter()
            .filter_map(|s| match s.as_str() {
                "portal-d" => Some(PropertySource::Domain),
                "portal-r" => Some(PropertySource::RealEstate),
                _ => None,
            })
            .collect()
    };

    let options = pipeline_options(
        config,
        args.no_scoring || scrape_only,
        args.no_commute || scrape_only,
        args.no_database || scrape_only,
        args.no_details,
    );

    for &source in &sources {
        for &university in &universities {
            info!(%university, source = source.as_str(), "starting sweep");
            let mut orchestrator = build_orchestrator(config, source, options).await?;
            let profile_path = PathBuf::from(&config.output_dir).join(format!("profile-{}", source.as_str()));
            let areas = target_areas(university, source);

            match orchestrator.run(university, &areas, &profile_path).await {
                Ok(summary) => info!(%university, source = source.as_str(), ?summary, "sweep finished"),
                Err(err) => warn!(%university, source = source.as_str(), %err, "sweep aborted"),
            }
        }
    }

    Ok(())
}

async fn run_process_csv(config: &AppConfig, args: ProcessCsvArgs) -> Result<(), AppError> {
    let Some(university) = School::parse(&args.university) else {
        return Err(AppError::from(rentpipe_core::db::DbError::UnresolvableRegion(args.university.clone())));
    };

    let options = pipeline_options(config, args.no_scoring, args.no_commute, args.no_database, true);
    let mut orchestrator = build_orchestrator(config, PropertySource::RealEstate, options).await?;
    orchestrator.run_shared_source(university, &args.input).await?;
    Ok(())
}

async fn build_orchestrator(
    config: &AppConfig,
    source: PropertySource,
    options: PipelineOptions,
) -> Result<Orchestrator, AppError> {
    let adapter: Box<dyn rentpipe_core::adapter::SiteAdapter> = match source {
        PropertySource::Domain => Box::new(DomainAdapter),
        PropertySource::RealEstate => Box::new(RealEstateAdapter),
    };
    let browser = Box::new(ChromiumBrowserDriver::new(config.headless));

    let mut orchestrator = Orchestrator::new(adapter, browser, config.output_dir.clone(), options);

    if !options.no_database {
        let db_config = config.require_database()?;
        let sink = SqlxDbSink::connect(&db_config.connection_url()).await?;
        orchestrator = orchestrator.with_db(Arc::new(sink));
    }

    if !options.no_scoring {
        let scoring_config = config.require_scoring()?;
        let gateway = Arc::new(DashscopeGateway::new(scoring_config));
        let service = Arc::new(ScoringService::new(gateway, scoring_config.num_calls));
        orchestrator = orchestrator.with_scoring(service, scoring_config.max_workers);
    }

    if !options.no_commute {
        let commute_config = config.require_commute()?;
        let gateway = Arc::new(GoogleMapsGateway::new(commute_config.api_key.clone()));
        let service = Arc::new(CommuteService::new(
            gateway,
            Duration::from_millis(commute_config.request_delay_ms),
        ));
        orchestrator = orchestrator.with_commute(service, commute_config.max_workers);
    }

    Ok(orchestrator)
}

/// Portal-specific search-area tokens, ported from the original's
/// `TARGET_AREAS` table.
fn target_areas(university: School, source: PropertySource) -> Vec<String> {
    let _ = source;
    let areas: &[&str] = match university {
        School::Unsw => &[
            "newtown-nsw-2042",
            "eastgardens-nsw-2036",
            "pagewood-nsw-2035",
            "maroubra-nsw-2035",
            "kensington-nsw-2033",
            "kingsford-nsw-2032",
            "randwick-nsw-2031",
            "mascot-nsw-2020",
            "rosebery-nsw-2018",
            "zetland-nsw-2017",
        ],
        School::Usyd => &[
            "sydney-city-nsw",
            "wolli-creek-nsw-2205",
            "hurstville-nsw-2220",
            "burwood-nsw-2134",
            "newtown-nsw-2042",
            "glebe-nsw-2037",
            "waterloo-nsw-2017",
            "chippendale-nsw-2008",
            "ultimo-nsw-2007",
            "haymarket-nsw-2000",
        ],
        School::Uts => &[
            "sydney-city-nsw",
            "ultimo-nsw-2007",
            "haymarket-nsw-2000",
            "pyrmont-nsw-2009",
            "chippendale-nsw-2008",
            "surry-hills-nsw-2010",
            "redfern-nsw-2016",
            "waterloo-nsw-2017",
            "glebe-nsw-2037",
            "newtown-nsw-2042",
        ],
    };
    areas.iter().map(|s| s.to_string()).collect()
}
