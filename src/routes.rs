use axum::{
    routing::{delete, get, post},
    Extension, Router,
};

use crate::billing::{api, BillingContext};
use crate::extractor::SessionConfig;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/cron/sync-subscriptions", get(api::sync_subscriptions))
        .route(
            "/api/subscription",
            get(api::get_subscription).post(api::create_subscription),
        )
        .route("/api/subscription/entitlement", get(api::get_entitlement))
        .route("/api/subscription/cancel", post(api::cancel_subscription))
        .route(
            "/api/subscription/reactivate",
            post(api::reactivate_subscription),
        )
        .route("/api/webhooks/stripe", post(api::stripe_webhook))
        .route("/api/account", delete(api::delete_account))
}

/// Routes with their dependencies attached; `main` adds metrics on top.
pub fn app(ctx: BillingContext, session: SessionConfig) -> Router {
    api_routes()
        .layer(Extension(ctx))
        .layer(Extension(session))
}
