use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::models::{SubscriptionMirror, UnknownStatus};

pub const METADATA_USER_ID: &str = "userId";
pub const METADATA_PLAN: &str = "plan";
pub const METADATA_INTERVAL: &str = "interval";

/// Page size used when walking the processor's subscription listing.
pub const LIST_PAGE_SIZE: u32 = 100;

/// key: billing-provider-error -> processor failures
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("billing provider unreachable: {0}")]
    Transport(String),
    #[error("billing provider returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("failed to decode billing provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Transport failures, rate limiting and 5xx responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) => false,
        }
    }
}

/// key: billing-external-customer -> processor customer object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
}

impl ExternalCustomer {
    pub fn user_id(&self) -> Option<&str> {
        if self.deleted {
            return None;
        }
        non_empty(self.metadata.get(METADATA_USER_ID))
    }

    pub fn live_email(&self) -> Option<&str> {
        if self.deleted {
            return None;
        }
        non_empty(self.email.as_ref())
    }
}

/// Subscriptions carry either the bare customer id or the expanded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomerRef {
    Expanded(ExternalCustomer),
    Id(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<ItemPrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPrice {
    pub id: String,
}

/// key: billing-external-subscription -> processor subscription object
///
/// `status` stays the raw processor string so drift detection is a plain
/// string comparison; it is parsed only when copied onto a local row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSubscription {
    pub id: String,
    pub customer: CustomerRef,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub current_period_end: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

impl ExternalSubscription {
    pub fn customer_id(&self) -> &str {
        match &self.customer {
            CustomerRef::Expanded(customer) => &customer.id,
            CustomerRef::Id(id) => id,
        }
    }

    pub fn customer(&self) -> Option<&ExternalCustomer> {
        match &self.customer {
            CustomerRef::Expanded(customer) => Some(customer),
            CustomerRef::Id(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        non_empty(self.metadata.get(METADATA_USER_ID))
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        non_empty(self.metadata.get(key))
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    pub fn mirror(&self) -> Result<SubscriptionMirror, UnknownStatus> {
        Ok(SubscriptionMirror {
            status: self.status.parse()?,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
        })
    }
}

/// Summary returned to callers of cancel/reactivate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSubscriptionSummary {
    pub id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: DateTime<Utc>,
}

impl From<&ExternalSubscription> for ExternalSubscriptionSummary {
    fn from(subscription: &ExternalSubscription) -> Self {
        Self {
            id: subscription.id.clone(),
            status: subscription.status.clone(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_end: subscription.current_period_end,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalPage<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

/// key: billing-checkout-request -> hosted checkout in subscription mode
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub user_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Stamped on both the session and the subscription it creates.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// key: billing-provider -> external source of truth
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// One page of subscriptions in every status, customers expanded.
    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
        limit: u32,
    ) -> Result<ExternalPage<ExternalSubscription>, ProviderError>;

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<ExternalCustomer>, ProviderError>;

    async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError>;

    async fn tag_customer_user(
        &self,
        customer_id: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<ExternalSubscription, ProviderError>;
}

/// Walks the listing page by page. Each request needs the last id of the
/// previous page, so pages are fetched strictly in sequence.
pub async fn fetch_all_subscriptions(
    provider: &dyn BillingProvider,
    page_size: u32,
) -> Result<Vec<ExternalSubscription>, ProviderError> {
    let mut collected: Vec<ExternalSubscription> = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = provider
            .list_subscriptions(cursor.as_deref(), page_size)
            .await?;
        let page_len = page.data.len();
        let last_id = page.data.last().map(|subscription| subscription.id.clone());
        collected.extend(page.data);
        debug!(
            page_len,
            total = collected.len(),
            has_more = page.has_more,
            "fetched billing subscription page"
        );
        match (page.has_more, last_id) {
            (true, Some(last_id)) => cursor = Some(last_id),
            _ => break,
        }
    }
    Ok(collected)
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
