use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(pairgate::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(
        code(pairgate::config),
        help("Check config.toml and PAIRGATE__* environment overrides")
    )]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(pairgate::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(pairgate::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(pairgate::jose))]
    Jose(String),

    #[error("Scheduler error: {0}")]
    #[diagnostic(code(pairgate::scheduler))]
    Scheduler(String),

    #[error("{0}")]
    #[diagnostic(code(pairgate::other))]
    Other(String),
}

impl From<josekit::JoseError> for AppError {
    fn from(value: josekit::JoseError) -> Self {
        AppError::Jose(value.to_string())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for AppError {
    fn from(value: tokio_cron_scheduler::JobSchedulerError) -> Self {
        AppError::Scheduler(value.to_string())
    }
}
