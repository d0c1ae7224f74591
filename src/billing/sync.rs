use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use super::audit::{AuditAction, AuditNote, AuditSource};
use super::matching::resolve_owner;
use super::models::{NewSubscription, Subscription, DEFAULT_INTERVAL, DEFAULT_PLAN};
use super::provider::{ExternalSubscription, METADATA_INTERVAL, METADATA_PLAN};
use super::store::SubscriptionStore;

/// key: billing-sync-outcome -> result of applying one external record
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Created(Subscription),
    Mirrored(Subscription),
    SoftCanceled(Subscription),
    /// The local row already matched; nothing was written.
    Unchanged(Subscription),
    /// No local user could be tied to the external subscription.
    OwnerUnresolved,
}

impl SyncOutcome {
    pub fn wrote(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Created(_) | SyncOutcome::Mirrored(_) | SyncOutcome::SoftCanceled(_)
        )
    }
}

/// key: billing-sync -> per-row fixes shared by reconciler and webhooks
#[derive(Clone)]
pub struct SubscriptionSync {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionSync {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Creates the local counterpart of an external subscription. Owners that
    /// cannot be resolved are reported, never invented.
    pub async fn create_from_external(
        &self,
        remote: &ExternalSubscription,
        source: AuditSource,
    ) -> Result<SyncOutcome> {
        let Some(owner) = resolve_owner(self.store.as_ref(), remote).await? else {
            warn!(
                subscription = %remote.id,
                customer = %remote.customer_id(),
                customer_email = ?remote.customer().and_then(|c| c.email.as_deref()),
                "no local user matches external subscription; skipping"
            );
            return Ok(SyncOutcome::OwnerUnresolved);
        };

        let mirror = remote.mirror()?;
        let record = NewSubscription {
            user_id: owner.user.id.clone(),
            external_subscription_id: remote.id.clone(),
            external_customer_id: remote.customer_id().to_string(),
            external_price_id: remote.price_id().map(str::to_string),
            plan: remote
                .metadata_value(METADATA_PLAN)
                .unwrap_or(DEFAULT_PLAN)
                .to_string(),
            interval: remote
                .metadata_value(METADATA_INTERVAL)
                .unwrap_or(DEFAULT_INTERVAL)
                .to_string(),
            mirror,
        };
        let note = AuditNote::new(
            source,
            AuditAction::Created,
            json!({
                "external_subscription_id": remote.id,
                "external_customer_id": record.external_customer_id,
                "status": remote.status,
                "owner_strategy": owner.strategy,
            }),
        );
        let upserted = self.store.insert_subscription(&record, &note).await?;
        let row = upserted.subscription;
        if !upserted.inserted {
            info!(
                subscription = %row.id,
                external_subscription = %remote.id,
                user_id = %row.user_id,
                "local subscription already existed; mirrored billing provider state"
            );
            return Ok(SyncOutcome::Mirrored(row));
        }
        info!(
            subscription = %row.id,
            external_subscription = %remote.id,
            user_id = %row.user_id,
            strategy = owner.strategy,
            "created local subscription from billing provider"
        );
        Ok(SyncOutcome::Created(row))
    }

    /// Overwrites status, cancel flag and period bounds with the external values.
    pub async fn mirror_external(
        &self,
        local: &Subscription,
        remote: &ExternalSubscription,
        source: AuditSource,
    ) -> Result<SyncOutcome> {
        let mirror = remote.mirror()?;
        if local.mirror() == mirror {
            return Ok(SyncOutcome::Unchanged(local.clone()));
        }
        let note = AuditNote::new(
            source,
            AuditAction::Mirrored,
            json!({
                "external_subscription_id": remote.id,
                "previous_status": local.status,
                "status": remote.status,
                "previous_cancel_at_period_end": local.cancel_at_period_end,
                "cancel_at_period_end": remote.cancel_at_period_end,
            }),
        );
        let updated = self.store.apply_mirror(local.id, &mirror, &note).await?;
        info!(
            subscription = %updated.id,
            external_subscription = %remote.id,
            user_id = %updated.user_id,
            from = %local.status,
            to = %updated.status,
            "mirrored billing provider state onto local subscription"
        );
        Ok(SyncOutcome::Mirrored(updated))
    }

    /// Marks a row whose external counterpart is gone as canceled at period
    /// end. The row and its period bounds are kept.
    pub async fn soft_cancel(
        &self,
        local: &Subscription,
        source: AuditSource,
    ) -> Result<SyncOutcome> {
        if local.is_soft_canceled() {
            return Ok(SyncOutcome::Unchanged(local.clone()));
        }
        let note = AuditNote::new(
            source,
            AuditAction::SoftCanceled,
            json!({
                "external_subscription_id": local.external_subscription_id,
                "previous_status": local.status,
                "current_period_end": local.current_period_end,
            }),
        );
        let updated = self.store.soft_cancel(local.id, &note).await?;
        info!(
            subscription = %updated.id,
            user_id = %updated.user_id,
            "soft-canceled subscription missing from billing provider"
        );
        Ok(SyncOutcome::SoftCanceled(updated))
    }
}
