use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::actions::{PriceSelection, SubscriptionActionService};
use super::models::{Subscription, SubscriptionStatus};
use super::provider::ExternalSubscriptionSummary;
use super::reconciler::{ReconciliationStats, Reconciler};
use super::store::{current_subscription, SubscriptionStore};
use super::webhook::{
    parse_event, verify_signature, WebhookError, WebhookEventHandler, WebhookOutcome,
    SIGNATURE_HEADER,
};

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

/// key: billing-api-context -> shared handler dependencies
#[derive(Clone)]
pub struct BillingContext {
    pub store: Arc<dyn SubscriptionStore>,
    pub reconciler: Arc<Reconciler>,
    pub webhooks: WebhookEventHandler,
    pub actions: Arc<SubscriptionActionService>,
    pub cron_secret: Option<String>,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    pub stats: ReconciliationStats,
}

/// key: billing-api -> reconciliation trigger
pub async fn sync_subscriptions(
    Extension(ctx): Extension<BillingContext>,
    headers: HeaderMap,
) -> Response {
    if let Some(secret) = &ctx.cron_secret {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if !bearer_matches(secret, presented) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response();
        }
    }

    match ctx.reconciler.run().await {
        Ok(report) => {
            let message = if report.ledger.failed.is_empty() {
                "Subscription sync completed".to_string()
            } else {
                format!(
                    "Subscription sync completed; {} subscription(s) could not be fixed",
                    report.ledger.failed.len()
                )
            };
            Json(SyncResponse {
                success: true,
                message,
                stats: report.stats,
            })
            .into_response()
        }
        Err(err) => {
            error!(?err, "subscription sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to sync subscriptions",
                    "message": format!("{err:#}"),
                })),
            )
                .into_response()
        }
    }
}

/// Either `{ priceId }` or the legacy `{ plan, interval }` pair.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    #[serde(default)]
    pub price_id: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
}

impl CreateSubscriptionRequest {
    pub fn selection(&self) -> Result<PriceSelection, AppError> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        if let Some(price_id) = non_empty(&self.price_id) {
            return Ok(PriceSelection::Price(price_id));
        }
        match (non_empty(&self.plan), non_empty(&self.interval)) {
            (Some(plan), Some(interval)) => Ok(PriceSelection::PlanInterval { plan, interval }),
            (Some(_), None) => Err(AppError::Validation {
                field: "interval".into(),
                message: "interval is required when plan is given".into(),
            }),
            _ => Err(AppError::Validation {
                field: "priceId".into(),
                message: "provide priceId or a plan and interval".into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub async fn create_subscription(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> AppResult<Json<CheckoutResponse>> {
    let Json(payload) = payload.map_err(body_rejection)?;
    let selection = payload.selection()?;
    let url = ctx
        .actions
        .create_checkout(&user.user_id, &selection)
        .await?;
    Ok(Json(CheckoutResponse { url }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Option<Subscription>,
}

pub async fn get_subscription(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
) -> AppResult<Json<SubscriptionResponse>> {
    let subscription = current_subscription(ctx.store.as_ref(), &user.user_id, Utc::now()).await?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementResponse {
    pub entitled: bool,
    pub status: Option<SubscriptionStatus>,
    pub current_period_end: Option<DateTime<Utc>>,
}

pub async fn get_entitlement(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
) -> AppResult<Json<EntitlementResponse>> {
    let subscription = current_subscription(ctx.store.as_ref(), &user.user_id, Utc::now()).await?;
    Ok(Json(EntitlementResponse {
        entitled: subscription.is_some(),
        status: subscription.as_ref().map(|row| row.status),
        current_period_end: subscription.as_ref().map(|row| row.current_period_end),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTarget {
    pub subscription_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionSummaryResponse {
    pub subscription: ExternalSubscriptionSummary,
}

pub async fn cancel_subscription(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    payload: Result<Json<SubscriptionTarget>, JsonRejection>,
) -> AppResult<Json<SubscriptionSummaryResponse>> {
    let target = subscription_target(payload)?;
    let subscription = ctx.actions.cancel(&user.user_id, &target).await?;
    Ok(Json(SubscriptionSummaryResponse { subscription }))
}

pub async fn reactivate_subscription(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
    payload: Result<Json<SubscriptionTarget>, JsonRejection>,
) -> AppResult<Json<SubscriptionSummaryResponse>> {
    let target = subscription_target(payload)?;
    let subscription = ctx.actions.reactivate(&user.user_id, &target).await?;
    Ok(Json(SubscriptionSummaryResponse { subscription }))
}

/// key: billing-api -> processor webhook receiver
pub async fn stripe_webhook(
    Extension(ctx): Extension<BillingContext>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<serde_json::Value>> {
    let secret = ctx
        .webhook
        .secret
        .as_deref()
        .ok_or_else(|| AppError::Message("webhook signing secret is not configured".into()))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;
    verify_signature(
        secret,
        &body,
        signature,
        Utc::now(),
        ctx.webhook.tolerance_secs,
    )?;

    let event = parse_event(&body)?;
    let outcome = ctx
        .webhooks
        .handle(&event)
        .await
        .map_err(|err| match err.downcast::<WebhookError>() {
            Ok(webhook) => AppError::from(webhook),
            Err(err) => AppError::from(err),
        })?;

    Ok(Json(json!({
        "received": true,
        "duplicate": outcome == WebhookOutcome::Duplicate,
    })))
}

/// key: billing-api -> account deletion cascade
pub async fn delete_account(
    Extension(ctx): Extension<BillingContext>,
    user: AuthUser,
) -> AppResult<StatusCode> {
    if !ctx.store.delete_user_cascade(&user.user_id).await? {
        return Err(AppError::NotFound("user record not found".into()));
    }
    info!(user_id = %user.user_id, "account deleted with billing history");
    Ok(StatusCode::NO_CONTENT)
}

fn subscription_target(
    payload: Result<Json<SubscriptionTarget>, JsonRejection>,
) -> Result<String, AppError> {
    let Json(target) = payload.map_err(body_rejection)?;
    let subscription_id = target.subscription_id.trim();
    if subscription_id.is_empty() {
        return Err(AppError::Validation {
            field: "subscriptionId".into(),
            message: "subscriptionId must not be empty".into(),
        });
    }
    Ok(subscription_id.to_string())
}

/// Compares MAC tags so the check takes the same time wherever the tokens differ.
fn bearer_matches(secret: &str, presented: Option<&str>) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let tag = |value: &str| {
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (tag(secret), tag(presented)) {
        (Ok(expected), Ok(candidate)) => candidate
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn body_rejection(rejection: JsonRejection) -> AppError {
    AppError::Validation {
        field: "body".into(),
        message: rejection.body_text(),
    }
}
