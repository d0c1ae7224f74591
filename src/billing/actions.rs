use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use super::audit::{AuditAction, AuditNote, AuditSource};
use super::provider::{
    BillingProvider, CheckoutRequest, ExternalCustomer, ExternalSubscriptionSummary,
    ProviderError, METADATA_INTERVAL, METADATA_PLAN, METADATA_USER_ID,
};
use super::store::{current_subscription, SubscriptionStore};

/// key: billing-action-error -> user-facing lifecycle failures
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    InvalidPrice(String),
    #[error("user already has an active subscription")]
    AlreadySubscribed,
    #[error("user record not found")]
    UserNotFound,
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("subscription belongs to another user")]
    NotOwner,
    #[error("billing provider did not return a checkout url")]
    MissingCheckoutUrl,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What the caller asked to buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceSelection {
    Price(String),
    PlanInterval { plan: String, interval: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceEntry {
    pub plan: String,
    pub interval: String,
    pub price_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrice {
    pub price_id: String,
    pub plan: Option<String>,
    pub interval: Option<String>,
}

/// key: billing-price-catalog -> legacy plan/interval to price id mapping
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    entries: Vec<PriceEntry>,
}

impl PriceCatalog {
    pub fn new(entries: Vec<PriceEntry>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, selection: &PriceSelection) -> Result<ResolvedPrice, ActionError> {
        match selection {
            PriceSelection::Price(price_id) => {
                let price_id = price_id.trim();
                if price_id.is_empty() {
                    return Err(ActionError::InvalidPrice("priceId must not be empty".into()));
                }
                let known = self.entries.iter().find(|entry| entry.price_id == price_id);
                Ok(ResolvedPrice {
                    price_id: price_id.to_string(),
                    plan: known.map(|entry| entry.plan.clone()),
                    interval: known.map(|entry| entry.interval.clone()),
                })
            }
            PriceSelection::PlanInterval { plan, interval } => self
                .entries
                .iter()
                .find(|entry| {
                    entry.plan.eq_ignore_ascii_case(plan.trim())
                        && entry.interval.eq_ignore_ascii_case(interval.trim())
                })
                .map(|entry| ResolvedPrice {
                    price_id: entry.price_id.clone(),
                    plan: Some(entry.plan.clone()),
                    interval: Some(entry.interval.clone()),
                })
                .ok_or_else(|| {
                    ActionError::InvalidPrice(format!(
                        "no price configured for plan `{plan}` and interval `{interval}`"
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConfig {
    pub success_url: String,
    pub cancel_url: String,
}

/// key: billing-actions -> checkout, cancel, reactivate
///
/// Writes go to the processor only; the local row follows through the
/// webhook or the next reconciliation pass.
pub struct SubscriptionActionService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn SubscriptionStore>,
    catalog: PriceCatalog,
    checkout: CheckoutConfig,
}

impl SubscriptionActionService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn SubscriptionStore>,
        catalog: PriceCatalog,
        checkout: CheckoutConfig,
    ) -> Self {
        Self {
            provider,
            store,
            catalog,
            checkout,
        }
    }

    /// Returns the hosted checkout url.
    pub async fn create_checkout(
        &self,
        user_id: &str,
        selection: &PriceSelection,
    ) -> Result<String, ActionError> {
        let price = self.catalog.resolve(selection)?;
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or(ActionError::UserNotFound)?;

        if let Some(existing) =
            current_subscription(self.store.as_ref(), &user.id, Utc::now()).await?
        {
            warn!(
                user_id = %user.id,
                subscription = %existing.id,
                status = %existing.status,
                "checkout refused: user already entitled"
            );
            return Err(ActionError::AlreadySubscribed);
        }

        let customer = self.find_or_create_customer(&user.email, &user.id).await?;

        let mut metadata = BTreeMap::from([(METADATA_USER_ID.to_string(), user.id.clone())]);
        if let Some(plan) = &price.plan {
            metadata.insert(METADATA_PLAN.to_string(), plan.clone());
        }
        if let Some(interval) = &price.interval {
            metadata.insert(METADATA_INTERVAL.to_string(), interval.clone());
        }

        let request = CheckoutRequest {
            customer_id: customer.id.clone(),
            price_id: price.price_id.clone(),
            user_id: user.id.clone(),
            success_url: self.checkout.success_url.clone(),
            cancel_url: self.checkout.cancel_url.clone(),
            metadata,
        };
        let session = self.provider.create_checkout_session(&request).await?;
        let url = session.url.ok_or(ActionError::MissingCheckoutUrl)?;

        self.audit(
            None,
            &user.id,
            AuditAction::CheckoutStarted,
            json!({
                "session_id": session.id,
                "price_id": price.price_id,
                "external_customer_id": customer.id,
            }),
        )
        .await;
        info!(user_id = %user.id, session = %session.id, "checkout session created");
        Ok(url)
    }

    pub async fn cancel(
        &self,
        user_id: &str,
        external_subscription_id: &str,
    ) -> Result<ExternalSubscriptionSummary, ActionError> {
        self.set_cancel_flag(user_id, external_subscription_id, true)
            .await
    }

    pub async fn reactivate(
        &self,
        user_id: &str,
        external_subscription_id: &str,
    ) -> Result<ExternalSubscriptionSummary, ActionError> {
        self.set_cancel_flag(user_id, external_subscription_id, false)
            .await
    }

    async fn set_cancel_flag(
        &self,
        user_id: &str,
        external_subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<ExternalSubscriptionSummary, ActionError> {
        let local = self
            .store
            .find_by_external_id(external_subscription_id)
            .await?
            .ok_or(ActionError::SubscriptionNotFound)?;
        if local.user_id != user_id {
            warn!(
                user_id,
                owner = %local.user_id,
                external_subscription = external_subscription_id,
                "refusing subscription change for non-owner"
            );
            return Err(ActionError::NotOwner);
        }

        let updated = self
            .provider
            .set_cancel_at_period_end(external_subscription_id, cancel_at_period_end)
            .await?;

        let action = if cancel_at_period_end {
            AuditAction::CancelRequested
        } else {
            AuditAction::ReactivateRequested
        };
        self.audit(
            Some(local.id),
            user_id,
            action,
            json!({
                "external_subscription_id": external_subscription_id,
                "status": updated.status,
                "cancel_at_period_end": updated.cancel_at_period_end,
            }),
        )
        .await;
        info!(
            user_id,
            external_subscription = external_subscription_id,
            cancel_at_period_end,
            "subscription cancel flag updated at billing provider"
        );
        Ok(ExternalSubscriptionSummary::from(&updated))
    }

    async fn find_or_create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ActionError> {
        match self.provider.find_customer_by_email(email).await? {
            Some(customer) if customer.user_id().is_some() => Ok(customer),
            Some(customer) => {
                info!(customer = %customer.id, user_id, "backfilling customer user metadata");
                Ok(self.provider.tag_customer_user(&customer.id, user_id).await?)
            }
            None => Ok(self.provider.create_customer(email, user_id).await?),
        }
    }

    /// The processor call already succeeded, so audit failures only log.
    async fn audit(
        &self,
        subscription_id: Option<uuid::Uuid>,
        user_id: &str,
        action: AuditAction,
        details: serde_json::Value,
    ) {
        let note = AuditNote::new(AuditSource::User, action, details);
        if let Err(err) = self
            .store
            .record_audit(subscription_id, Some(user_id), &note)
            .await
        {
            warn!(?err, user_id, action = action.as_str(), "failed to record billing audit entry");
        }
    }
}
