mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod models;
mod routes;
mod service;
mod utils;

use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use config::Config;
use db::{DBClient, EngineStore, MemoryStore};
use dotenv::dotenv;
use routes::create_router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

use service::{
    background_jobs,
    fee_calculator::FeeCalculator,
    milestone_planner::MilestonePlanner,
    payment_flow::PaymentFlowController,
    payment_provider::{GatewayError, PaymentProviderService},
    verification_poller::VerificationPoller,
};

#[derive(Clone)]
pub struct AppState {
    pub env: Config,
    pub store: Arc<dyn EngineStore>,
    pub providers: Arc<PaymentProviderService>,
    pub flow: Arc<PaymentFlowController>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn EngineStore>) -> Result<Self, GatewayError> {
        let providers = Arc::new(PaymentProviderService::from_config(&config)?);
        Ok(Self::with_providers(config, store, providers))
    }

    pub fn with_providers(
        config: Config,
        store: Arc<dyn EngineStore>,
        providers: Arc<PaymentProviderService>,
    ) -> Self {
        let flow = Arc::new(PaymentFlowController::new(
            store.clone(),
            providers.clone(),
            FeeCalculator::from_config(&config),
            MilestonePlanner::from_config(&config),
            VerificationPoller::from_config(&config),
        ));

        Self {
            env: config,
            store,
            providers,
            flow,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::init();

    tracing_subscriber::fmt()
        .with_max_level(
            config
                .log_level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::DEBUG),
        )
        .init();

    let store: Arc<dyn EngineStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            tracing::info!("Connection to the database is successful");

            let db_client = DBClient::new(pool);
            db_client.migrate().await?;
            tracing::info!("Database migrations applied");
            Arc::new(db_client)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let app_state = Arc::new(AppState::new(config.clone(), store)?);
    tracing::info!(
        "Payments go through {} first",
        app_state.providers.primary_name()
    );

    background_jobs::reconcile_milestones_on_startup(app_state.clone()).await;
    tokio::spawn(background_jobs::start_payment_reconciliation_job(
        app_state.clone(),
    ));

    let allowed_origins = vec![
        HeaderValue::from_static("https://verinestorg.vercel.app"),
        HeaderValue::from_static("http://localhost:5173"),
        HeaderValue::from_static("http://localhost:8000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST]);

    let app = create_router(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server is running on http://localhost:{}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}
