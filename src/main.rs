use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use promptaat_billing::billing::{
    spawn_reconcile_scheduler, BillingContext, BillingProvider, PgSubscriptionStore, Reconciler,
    StripeClient, SubscriptionActionService, SubscriptionStore, SubscriptionSync, WebhookConfig,
    WebhookEventHandler,
};
use promptaat_billing::config;
use promptaat_billing::extractor::SessionConfig;
use promptaat_billing::routes;

async fn root() -> &'static str {
    "Promptaat Billing API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the processor key is missing
    let stripe_key = config::STRIPE_SECRET_KEY
        .clone()
        .ok_or("STRIPE_SECRET_KEY must be set")?;
    if config::JWT_SECRET.is_none() {
        tracing::warn!("JWT_SECRET is not set; authenticated routes will report session_unavailable");
    }
    if config::CRON_SECRET.is_none() {
        tracing::warn!("CRON_SECRET is not set; the reconciliation trigger is unauthenticated");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let provider: Arc<dyn BillingProvider> = Arc::new(StripeClient::new(
        config::STRIPE_API_BASE.as_str(),
        stripe_key,
        config::list_retry_config(),
    )?);
    let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
    let reconciler = Arc::new(Reconciler::new(provider.clone(), store.clone()));
    let ctx = BillingContext {
        store: store.clone(),
        reconciler: reconciler.clone(),
        webhooks: WebhookEventHandler::new(SubscriptionSync::new(store.clone())),
        actions: Arc::new(SubscriptionActionService::new(
            provider,
            store,
            config::price_catalog(),
            config::checkout_config(),
        )),
        cron_secret: config::CRON_SECRET.clone(),
        webhook: WebhookConfig {
            secret: config::STRIPE_WEBHOOK_SECRET.clone(),
            tolerance_secs: *config::STRIPE_WEBHOOK_TOLERANCE_SECS,
        },
    };

    if let Some(interval) = config::reconcile_interval() {
        spawn_reconcile_scheduler(reconciler, interval);
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::app(ctx, SessionConfig::from_env()))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
