use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PLAN: &str = "pro";
pub const DEFAULT_INTERVAL: &str = "monthly";

/// key: billing-status -> processor vocabulary, stored verbatim
///
/// Values are compared and persisted as the processor spells them. There is no
/// internal remapping layer; an unknown value is an error, never a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 8] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Canceled,
        SubscriptionStatus::Incomplete,
        SubscriptionStatus::IncompleteExpired,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Unpaid,
        SubscriptionStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Statuses that grant access on their own, regardless of period bounds.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown subscription status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

/// key: billing-subscription-model -> user entitlement record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub external_price_id: Option<String>,
    pub plan: String,
    pub interval: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Access is granted while active/trialing, or while a canceled row that was
    /// set to lapse at period end has not reached that end yet.
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        if self.status.grants_access() {
            return true;
        }
        self.status == SubscriptionStatus::Canceled
            && self.cancel_at_period_end
            && now < self.current_period_end
    }

    /// True once the row carries the orphan soft-delete markers.
    pub fn is_soft_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled && self.cancel_at_period_end
    }

    pub fn mirror(&self) -> SubscriptionMirror {
        SubscriptionMirror {
            status: self.status,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
        }
    }
}

/// Raw row shape; `status` is validated on the way out of the database.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: String,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub external_price_id: Option<String>,
    pub plan: String,
    pub interval: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = UnknownStatus;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            external_subscription_id: row.external_subscription_id,
            external_customer_id: row.external_customer_id,
            external_price_id: row.external_price_id,
            plan: row.plan,
            interval: row.interval,
            status: row.status.parse()?,
            cancel_at_period_end: row.cancel_at_period_end,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// key: billing-owner -> user fields carried for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct BillingUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
}

/// A local subscription joined with its owner, as listed by the reconciler.
#[derive(Debug, Clone)]
pub struct OwnedSubscription {
    pub subscription: Subscription,
    pub owner: BillingUser,
}

/// Fields written when a row is created from the processor's record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub user_id: String,
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub external_price_id: Option<String>,
    pub plan: String,
    pub interval: String,
    pub mirror: SubscriptionMirror,
}

/// Row returned by an insert keyed on the external subscription id.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedSubscription {
    pub subscription: Subscription,
    /// False when an existing row absorbed the write.
    pub inserted: bool,
}

/// The processor-owned fields copied onto a local row in one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionMirror {
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}
