use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::{signal, sync::mpsc};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use academy_api as api;
use api::auth::{AuthService, Role};

#[derive(Parser)]
#[command(name = "academy-api", version, about = "Academy checkout and scheduling server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Create missing tables and exit
    Migrate,
    /// Print a bearer token for a user, for operators and local testing
    IssueToken {
        #[arg(long)]
        user_id: Uuid,
        #[arg(long, default_value = "user", value_parser = parse_role)]
        role: Role,
    },
}

fn parse_role(raw: &str) -> Result<Role, String> {
    raw.parse::<Role>()
        .map_err(|_| format!("unknown role '{raw}', expected user, coach or admin"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let auth_service = Arc::new(AuthService::new(
        cfg.jwt_secret.clone(),
        Duration::from_secs(cfg.jwt_expiration),
    ));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::IssueToken { user_id, role } => {
            let token = auth_service
                .issue_token(user_id, role)
                .context("failed to issue token")?;
            println!("{token}");
            Ok(())
        }
        Commands::Migrate => {
            let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
            api::db::create_schema(&db_pool).await?;
            info!("schema is up to date");
            Ok(())
        }
        Commands::Serve => serve(cfg, auth_service).await,
    }
}

async fn serve(cfg: api::config::AppConfig, auth_service: Arc<AuthService>) -> Result<()> {
    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::create_schema(&db_pool).await.map_err(|e| {
            error!("Failed creating schema: {}", e);
            e
        })?;
    }

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // External collaborators
    let gateway: Arc<dyn api::services::payment_gateway::PaymentGateway> = Arc::new(
        api::services::payment_gateway::HttpPaymentGateway::new(cfg.gateway.clone())
            .context("failed to build payment gateway client")?,
    );
    let notifier = api::services::notifications::sender_from_config(&cfg.sms)?;

    // Aggregate app services used by HTTP handlers
    let services = api::handlers::AppServices::new(
        db_pool.clone(),
        event_sender.clone(),
        gateway,
        notifier,
        &cfg,
    );

    // Compose shared app state
    let app_state = api::AppState {
        db: db_pool,
        config: cfg.clone(),
        event_sender,
        services,
        auth: auth_service,
    };

    let cors_layer = if cfg.is_production() {
        CorsLayer::new()
    } else {
        info!("Using permissive CORS outside production");
        CorsLayer::permissive()
    };

    let app = api::app_router(app_state).layer(cors_layer);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("academy-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
