use clap::Parser;
use miette::{IntoDiagnostic, Result};
use pairgate::device_auth::{
    DbIdentityResolver, DeviceAuthService, JwtTokenIssuer, OsCodeGenerator, SeaOrmDeviceAuthStore,
};
use pairgate::settings::Settings;
use pairgate::{jobs, jwks, storage, web};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "pairgate",
    version,
    about = "Device authorization service for QR/code based cross-device login"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(
        base_url = %settings.base_url(),
        ttl_secs = settings.device_auth.ttl_secs,
        "Loaded configuration"
    );

    // init storage (database + migrations)
    let db = storage::init(&settings.database).await?;

    ensure_bootstrap_admin(&db, &settings).await?;

    // init jwks (generate if missing)
    let jwks_mgr = jwks::JwksManager::new(settings.keys.clone()).await?;

    let da = &settings.device_auth;
    let device_auth = DeviceAuthService::new(
        settings.device_auth_config(),
        Arc::new(SeaOrmDeviceAuthStore::new(db.clone())),
        Arc::new(DbIdentityResolver::new(db.clone())),
        Arc::new(JwtTokenIssuer::new(
            jwks_mgr.clone(),
            settings.base_url(),
            settings.sessions.token_ttl_secs,
        )),
    )
    .with_code_generator(Arc::new(OsCodeGenerator::new(
        da.device_code_bytes,
        da.user_code_bytes,
    )));

    // keep the scheduler alive for the lifetime of the server
    let _scheduler = jobs::init_scheduler(db.clone(), device_auth.clone(), &settings).await?;

    let state = web::AppState {
        settings: Arc::new(settings),
        db,
        jwks: jwks_mgr,
        device_auth,
    };
    web::serve(state).await?;
    Ok(())
}

async fn ensure_bootstrap_admin(db: &sea_orm::DatabaseConnection, settings: &Settings) -> Result<()> {
    let (Some(username), Some(password)) = (
        settings.bootstrap.admin_username.as_deref(),
        settings.bootstrap.admin_password.as_deref(),
    ) else {
        return Ok(());
    };

    if storage::get_user_by_username(db, username)
        .await
        .into_diagnostic()?
        .is_none()
    {
        storage::create_user(db, username, password, None, true)
            .await
            .into_diagnostic()?;
        tracing::info!(username, "Created bootstrap administrator");
    }
    Ok(())
}
