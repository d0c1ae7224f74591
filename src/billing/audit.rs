use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-audit-source -> which writer touched the row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSource {
    Reconciler,
    Webhook,
    User,
}

impl AuditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSource::Reconciler => "reconciler",
            AuditSource::Webhook => "webhook",
            AuditSource::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Mirrored,
    SoftCanceled,
    CheckoutStarted,
    CancelRequested,
    ReactivateRequested,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Mirrored => "mirrored",
            AuditAction::SoftCanceled => "soft_canceled",
            AuditAction::CheckoutStarted => "checkout_started",
            AuditAction::CancelRequested => "cancel_requested",
            AuditAction::ReactivateRequested => "reactivate_requested",
        }
    }
}

/// Audit payload passed alongside a write; the store fills in row identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditNote {
    pub source: AuditSource,
    pub action: AuditAction,
    pub details: Value,
}

impl AuditNote {
    pub fn new(source: AuditSource, action: AuditAction, details: Value) -> Self {
        Self {
            source,
            action,
            details,
        }
    }

    pub fn with_action(self, action: AuditAction) -> Self {
        Self { action, ..self }
    }
}

/// key: billing-audit-log -> persisted entry
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BillingAuditEntry {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub source: String,
    pub action: String,
    pub details: Value,
    pub occurred_at: DateTime<Utc>,
}
