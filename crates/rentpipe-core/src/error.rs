use crate::adapter::AdapterError;
use crate::browser::BrowserError;
use crate::commute::CommuteError;
use crate::config::ConfigError;
use crate::db::DbError;
use crate::orchestrator::OrchestratorError;
use crate::scoring::ScoringError;
use crate::telemetry::TelemetryError;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Browser(BrowserError),
    Adapter(AdapterError),
    Scoring(ScoringError),
    Commute(CommuteError),
    Db(DbError),
    Orchestrator(OrchestratorError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {err}"),
            AppError::Telemetry(err) => write!(f, "telemetry error: {err}"),
            AppError::Io(err) => write!(f, "io error: {err}"),
            AppError::Browser(err) => write!(f, "browser error: {err}"),
            AppError::Adapter(err) => write!(f, "site adapter error: {err}"),
            AppError::Scoring(err) => write!(f, "scoring error: {err}"),
            AppError::Commute(err) => write!(f, "commute error: {err}"),
            AppError::Db(err) => write!(f, "database error: {err}"),
            AppError::Orchestrator(err) => write!(f, "pipeline error: {err}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Browser(err) => Some(err),
            AppError::Adapter(err) => Some(err),
            AppError::Scoring(err) => Some(err),
            AppError::Commute(err) => Some(err),
            AppError::Db(err) => Some(err),
            AppError::Orchestrator(err) => Some(err),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<BrowserError> for AppError {
    fn from(value: BrowserError) -> Self {
        Self::Browser(value)
    }
}

impl From<AdapterError> for AppError {
    fn from(value: AdapterError) -> Self {
        Self::Adapter(value)
    }
}

impl From<ScoringError> for AppError {
    fn from(value: ScoringError) -> Self {
        Self::Scoring(value)
    }
}

impl From<CommuteError> for AppError {
    fn from(value: CommuteError) -> Self {
        Self::Commute(value)
    }
}

impl From<DbError> for AppError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(value: OrchestratorError) -> Self {
        Self::Orchestrator(value)
    }
}
