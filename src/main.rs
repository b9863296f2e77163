use clap::Parser;
use devicelink::clock::SystemClock;
use devicelink::identity::JwksVerifier;
use devicelink::service::DeviceAuthorizationService;
use devicelink::settings::Settings;
use devicelink::store::{self, CodeStore, SqlCodeStore};
use devicelink::{jobs, web};
use miette::Result;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "devicelink",
    version,
    about = "OAuth 2.0 Device Authorization Grant server"
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

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = store::sql::init(&settings.database).await?;
    let clock = Arc::new(SystemClock);
    let code_store: Arc<dyn CodeStore> = Arc::new(SqlCodeStore::new(db, clock.clone()));

    // identity provider keys for second-screen bearer tokens
    let verifier = JwksVerifier::load(&settings.identity)?;

    let service = DeviceAuthorizationService::new(
        code_store.clone(),
        Arc::new(verifier),
        clock,
        settings.device.clone(),
    );

    // expired code sweep; keep the handle alive for the server's lifetime
    let _scheduler = jobs::init_scheduler(code_store, &settings.device.sweep_schedule).await?;

    // start web server
    web::serve(settings, service).await?;
    Ok(())
}
