use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::audit::AuditSource;
use super::matching::classify;
use super::provider::{fetch_all_subscriptions, BillingProvider, LIST_PAGE_SIZE};
use super::store::SubscriptionStore;
use super::sync::{SubscriptionSync, SyncOutcome};

/// key: billing-reconciliation-stats -> summary returned to the cron trigger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStats {
    pub stripe_subscriptions: usize,
    pub db_subscriptions: usize,
    pub missing_in_db: usize,
    pub missing_in_stripe: usize,
    pub status_mismatches: usize,
    pub fixed_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    MissingLocally,
    StatusMismatch,
    MissingExternally,
}

/// One row of the classified diff, identified well enough to repair by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixTarget {
    pub kind: FixKind,
    pub external_subscription_id: String,
    pub subscription_id: Option<Uuid>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFix {
    pub target: FixTarget,
    pub reason: String,
}

/// key: billing-fix-ledger -> fold of per-row results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixLedger {
    pub fixed: Vec<FixTarget>,
    pub failed: Vec<FailedFix>,
    /// Rows examined but left alone: unresolved owners and already-applied fixes.
    pub skipped: Vec<FixTarget>,
}

impl FixLedger {
    pub fn absorb(mut self, target: FixTarget, result: Result<SyncOutcome>) -> Self {
        match result {
            Ok(outcome) if outcome.wrote() => {
                let target = match &outcome {
                    SyncOutcome::Created(row)
                    | SyncOutcome::Mirrored(row)
                    | SyncOutcome::SoftCanceled(row) => FixTarget {
                        subscription_id: Some(row.id),
                        user_id: Some(row.user_id.clone()),
                        ..target
                    },
                    _ => target,
                };
                self.fixed.push(target);
            }
            Ok(_) => self.skipped.push(target),
            Err(err) => {
                error!(
                    ?err,
                    kind = ?target.kind,
                    external_subscription = %target.external_subscription_id,
                    subscription = ?target.subscription_id,
                    user_id = ?target.user_id,
                    "failed to fix subscription drift"
                );
                self.failed.push(FailedFix {
                    target,
                    reason: format!("{err:#}"),
                });
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub stats: ReconciliationStats,
    pub ledger: FixLedger,
}

/// key: billing-reconciler -> full diff between processor and local store
pub struct Reconciler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn SubscriptionStore>,
    sync: SubscriptionSync,
    page_size: u32,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn SubscriptionStore>) -> Self {
        let sync = SubscriptionSync::new(store.clone());
        Self {
            provider,
            store,
            sync,
            page_size: LIST_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Listing failures abort the run; failures fixing a single row are
    /// recorded in the ledger and the run continues.
    pub async fn run(&self) -> Result<ReconciliationReport> {
        let remote = fetch_all_subscriptions(self.provider.as_ref(), self.page_size)
            .await
            .context("failed to list subscriptions from billing provider")?;
        let local = self.store.list_subscriptions().await?;
        let diff = classify(&remote, &local);

        let mut stats = ReconciliationStats {
            stripe_subscriptions: remote.len(),
            db_subscriptions: local.len(),
            missing_in_db: diff.missing_locally.len(),
            missing_in_stripe: diff.missing_externally.len(),
            status_mismatches: diff.status_mismatches.len(),
            fixed_count: 0,
        };
        info!(?stats, "billing reconciliation diff computed");

        let mut ledger = FixLedger::default();

        for subscription in &diff.missing_locally {
            let target = FixTarget {
                kind: FixKind::MissingLocally,
                external_subscription_id: subscription.id.clone(),
                subscription_id: None,
                user_id: subscription.user_id().map(str::to_string),
            };
            let result = self
                .sync
                .create_from_external(subscription, AuditSource::Reconciler)
                .await;
            ledger = ledger.absorb(target, result);
        }

        for (owned, subscription) in &diff.status_mismatches {
            let target = FixTarget {
                kind: FixKind::StatusMismatch,
                external_subscription_id: subscription.id.clone(),
                subscription_id: Some(owned.subscription.id),
                user_id: Some(owned.owner.id.clone()),
            };
            let result = self
                .sync
                .mirror_external(&owned.subscription, subscription, AuditSource::Reconciler)
                .await;
            ledger = ledger.absorb(target, result);
        }

        for owned in &diff.missing_externally {
            let target = FixTarget {
                kind: FixKind::MissingExternally,
                external_subscription_id: owned
                    .subscription
                    .external_subscription_id
                    .clone()
                    .unwrap_or_default(),
                subscription_id: Some(owned.subscription.id),
                user_id: Some(owned.owner.id.clone()),
            };
            let result = self
                .sync
                .soft_cancel(&owned.subscription, AuditSource::Reconciler)
                .await;
            ledger = ledger.absorb(target, result);
        }

        stats.fixed_count = ledger.fixed.len();
        if ledger.failed.is_empty() {
            info!(?stats, skipped = ledger.skipped.len(), "billing reconciliation complete");
        } else {
            warn!(
                ?stats,
                failed = ledger.failed.len(),
                skipped = ledger.skipped.len(),
                "billing reconciliation completed with failures"
            );
        }

        Ok(ReconciliationReport { stats, ledger })
    }
}
