use anyhow::Result;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::audit::AuditSource;
use super::provider::ExternalSubscription;
use super::sync::{SubscriptionSync, SyncOutcome};

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature does not match payload")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// key: billing-webhook-signature -> `t=<unix>,v1=<hex hmac>` scheme
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<&str> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
    if candidates.is_empty() {
        return Err(WebhookError::MalformedSignature);
    }
    let issued_at: i64 = timestamp
        .parse()
        .map_err(|_| WebhookError::MalformedSignature)?;

    let mac = signed_mac(secret, timestamp, payload)?;
    let matched = candidates.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        mac.clone().verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(WebhookError::SignatureMismatch);
    }

    if (now.timestamp() - issued_at).abs() > tolerance_secs {
        return Err(WebhookError::StaleTimestamp);
    }
    Ok(())
}

/// Produces a header value for `payload`; used by tests and local tooling.
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, WebhookError> {
    let mac = signed_mac(secret, &timestamp.to_string(), payload)?;
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn signed_mac(
    secret: &str,
    timestamp: &str,
    payload: &[u8],
) -> Result<Hmac<Sha256>, WebhookError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::MalformedSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// key: billing-webhook-event-type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other(String),
}

impl From<&str> for BillingEventType {
    fn from(value: &str) -> Self {
        match value.strip_prefix("customer.").unwrap_or(value) {
            "subscription.created" => Self::SubscriptionCreated,
            "subscription.updated" => Self::SubscriptionUpdated,
            "subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Other(value.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub id: String,
    pub raw_type: String,
    pub event_type: BillingEventType,
    pub object: Value,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

pub fn parse_event(payload: &[u8]) -> Result<BillingEvent, WebhookError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
    Ok(BillingEvent {
        event_type: BillingEventType::from(raw.event_type.as_str()),
        id: raw.id,
        raw_type: raw.event_type,
        object: raw.data.object,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied(SyncOutcome),
    /// The event id was already processed.
    Duplicate,
    /// Event type not handled, or nothing local to act on.
    Ignored,
}

/// key: billing-webhook-handler -> single-event counterpart of the reconciler
///
/// Never calls the processor; it only writes the local store.
#[derive(Clone)]
pub struct WebhookEventHandler {
    sync: SubscriptionSync,
}

impl WebhookEventHandler {
    pub fn new(sync: SubscriptionSync) -> Self {
        Self { sync }
    }

    pub async fn handle(&self, event: &BillingEvent) -> Result<WebhookOutcome> {
        let store = self.sync.store();
        if store.webhook_event_processed(&event.id).await? {
            debug!(event_id = %event.id, "webhook event already processed");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match &event.event_type {
            BillingEventType::Other(kind) => {
                debug!(event_id = %event.id, kind = %kind, "ignoring unhandled webhook event");
                WebhookOutcome::Ignored
            }
            kind => {
                let remote: ExternalSubscription = serde_json::from_value(event.object.clone())
                    .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
                self.apply(kind, &remote).await?
            }
        };

        store
            .mark_webhook_event_processed(&event.id, &event.raw_type)
            .await?;
        info!(event_id = %event.id, kind = %event.raw_type, ?outcome, "webhook event handled");
        Ok(outcome)
    }

    async fn apply(
        &self,
        kind: &BillingEventType,
        remote: &ExternalSubscription,
    ) -> Result<WebhookOutcome> {
        let existing = self.sync.store().find_by_external_id(&remote.id).await?;
        let outcome = match (kind, existing) {
            (BillingEventType::SubscriptionCreated, None) => {
                self.sync
                    .create_from_external(remote, AuditSource::Webhook)
                    .await?
            }
            (BillingEventType::SubscriptionCreated, Some(local))
            | (BillingEventType::SubscriptionUpdated, Some(local)) => {
                self.sync
                    .mirror_external(&local, remote, AuditSource::Webhook)
                    .await?
            }
            (BillingEventType::SubscriptionUpdated, None) => {
                debug!(
                    subscription = %remote.id,
                    "update arrived before creation; creating local row"
                );
                self.sync
                    .create_from_external(remote, AuditSource::Webhook)
                    .await?
            }
            (BillingEventType::SubscriptionDeleted, Some(local)) => {
                self.sync.soft_cancel(&local, AuditSource::Webhook).await?
            }
            (BillingEventType::SubscriptionDeleted, None) => {
                warn!(
                    subscription = %remote.id,
                    "deletion for subscription with no local row"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            (BillingEventType::Other(_), _) => return Ok(WebhookOutcome::Ignored),
        };
        Ok(WebhookOutcome::Applied(outcome))
    }
}
