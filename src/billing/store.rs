use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::audit::{AuditAction, AuditNote, BillingAuditEntry};
use super::models::{
    BillingUser, NewSubscription, OwnedSubscription, Subscription, SubscriptionMirror,
    SubscriptionRow, UpsertedSubscription,
};

/// key: billing-store -> local subscription store
///
/// Every mutating call applies its row change and the accompanying audit note
/// as one atomic write.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<OwnedSubscription>>;

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Newest first.
    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    async fn find_user(&self, user_id: &str) -> Result<Option<BillingUser>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<BillingUser>>;

    /// Owner of the newest local row billed to this processor customer.
    async fn find_user_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> Result<Option<BillingUser>>;

    /// Inserts, or converges the existing row if another writer created the
    /// same external subscription first. The audit note is recorded as a
    /// mirror in that case.
    async fn insert_subscription(
        &self,
        record: &NewSubscription,
        note: &AuditNote,
    ) -> Result<UpsertedSubscription>;

    async fn apply_mirror(
        &self,
        subscription_id: Uuid,
        mirror: &SubscriptionMirror,
        note: &AuditNote,
    ) -> Result<Subscription>;

    async fn soft_cancel(&self, subscription_id: Uuid, note: &AuditNote) -> Result<Subscription>;

    async fn record_audit(
        &self,
        subscription_id: Option<Uuid>,
        user_id: Option<&str>,
        note: &AuditNote,
    ) -> Result<()>;

    async fn webhook_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_webhook_event_processed(&self, event_id: &str, event_type: &str) -> Result<()>;

    /// Removes the user together with its subscriptions and audit trail.
    async fn delete_user_cascade(&self, user_id: &str) -> Result<bool>;
}

/// Most recent row that currently grants access.
pub async fn current_subscription(
    store: &dyn SubscriptionStore,
    user_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Subscription>> {
    let rows = store.subscriptions_for_user(user_id).await?;
    Ok(rows.into_iter().find(|row| row.is_entitled(now)))
}

#[derive(Debug, FromRow)]
struct OwnedSubscriptionRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    owner_email: String,
    owner_name: Option<String>,
}

#[derive(Debug, FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    inserted: bool,
}

/// key: billing-store-pg -> sqlx implementation
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Option<Uuid>,
        user_id: Option<&str>,
        note: &AuditNote,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_log (id, subscription_id, user_id, source, action, details)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(user_id)
        .bind(note.source.as_str())
        .bind(note.action.as_str())
        .bind(&note.details)
        .execute(&mut *tx)
        .await
        .context("failed to append billing audit entry")?;
        Ok(())
    }

    /// Newest first.
    pub async fn audit_trail(&self, user_id: &str) -> Result<Vec<BillingAuditEntry>> {
        let entries = sqlx::query_as::<_, BillingAuditEntry>(
            r#"
            SELECT id, subscription_id, user_id, source, action, details, occurred_at
            FROM billing_audit_log
            WHERE user_id = $1
            ORDER BY occurred_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load billing audit trail")?;
        Ok(entries)
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn list_subscriptions(&self) -> Result<Vec<OwnedSubscription>> {
        let rows = sqlx::query_as::<_, OwnedSubscriptionRow>(
            r#"
            SELECT
                s.*,
                u.email AS owner_email,
                u.name AS owner_name
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            ORDER BY s.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list local subscriptions")?;

        rows.into_iter()
            .map(|row| -> Result<OwnedSubscription> {
                let owner = BillingUser {
                    id: row.subscription.user_id.clone(),
                    email: row.owner_email,
                    name: row.owner_name,
                };
                let subscription = Subscription::try_from(row.subscription)?;
                Ok(OwnedSubscription {
                    subscription,
                    owner,
                })
            })
            .collect()
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE external_subscription_id = $1",
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up subscription by external id")?;
        Ok(row.map(Subscription::try_from).transpose()?)
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list user subscriptions")?;
        rows.into_iter()
            .map(|row| Subscription::try_from(row).map_err(anyhow::Error::from))
            .collect()
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, name FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user")?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, name FROM users WHERE lower(email) = lower($1) LIMIT 1",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user by email")?;
        Ok(user)
    }

    async fn find_user_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> Result<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            r#"
            SELECT u.id, u.email, u.name
            FROM users u
            JOIN subscriptions s ON s.user_id = u.id
            WHERE s.external_customer_id = $1
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user by external customer")?;
        Ok(user)
    }

    async fn insert_subscription(
        &self,
        record: &NewSubscription,
        note: &AuditNote,
    ) -> Result<UpsertedSubscription> {
        let mut tx = self.pool.begin().await?;
        // xmax is zero only for a freshly inserted tuple
        let row = sqlx::query_as::<_, UpsertRow>(
            r#"
            INSERT INTO subscriptions (
                id,
                user_id,
                external_subscription_id,
                external_customer_id,
                external_price_id,
                plan,
                "interval",
                status,
                cancel_at_period_end,
                current_period_start,
                current_period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (external_subscription_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.user_id)
        .bind(&record.external_subscription_id)
        .bind(&record.external_customer_id)
        .bind(&record.external_price_id)
        .bind(&record.plan)
        .bind(&record.interval)
        .bind(record.mirror.status.as_str())
        .bind(record.mirror.cancel_at_period_end)
        .bind(record.mirror.current_period_start)
        .bind(record.mirror.current_period_end)
        .fetch_one(&mut tx)
        .await
        .context("failed to insert subscription")?;

        let note = if row.inserted {
            note.clone()
        } else {
            note.clone().with_action(AuditAction::Mirrored)
        };
        let subscription = row.subscription;
        Self::insert_audit(&mut tx, Some(subscription.id), Some(&subscription.user_id), &note)
            .await?;
        tx.commit().await?;
        Ok(UpsertedSubscription {
            subscription: Subscription::try_from(subscription)?,
            inserted: row.inserted,
        })
    }

    async fn apply_mirror(
        &self,
        subscription_id: Uuid,
        mirror: &SubscriptionMirror,
        note: &AuditNote,
    ) -> Result<Subscription> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = $2,
                cancel_at_period_end = $3,
                current_period_start = $4,
                current_period_end = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(mirror.status.as_str())
        .bind(mirror.cancel_at_period_end)
        .bind(mirror.current_period_start)
        .bind(mirror.current_period_end)
        .fetch_one(&mut tx)
        .await
        .context("failed to mirror subscription")?;

        Self::insert_audit(&mut tx, Some(row.id), Some(&row.user_id), note).await?;
        tx.commit().await?;
        Ok(Subscription::try_from(row)?)
    }

    async fn soft_cancel(&self, subscription_id: Uuid, note: &AuditNote) -> Result<Subscription> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                cancel_at_period_end = TRUE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&mut tx)
        .await
        .context("failed to soft-cancel subscription")?;

        Self::insert_audit(&mut tx, Some(row.id), Some(&row.user_id), note).await?;
        tx.commit().await?;
        Ok(Subscription::try_from(row)?)
    }

    async fn record_audit(
        &self,
        subscription_id: Option<Uuid>,
        user_id: Option<&str>,
        note: &AuditNote,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_audit(&mut tx, subscription_id, user_id, note).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn webhook_event_processed(&self, event_id: &str) -> Result<bool> {
        let seen: Option<String> = sqlx::query_scalar(
            "SELECT event_id FROM billing_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check webhook event ledger")?;
        Ok(seen.is_some())
    }

    async fn mark_webhook_event_processed(&self, event_id: &str, event_type: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_webhook_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .context("failed to record webhook event")?;
        Ok(())
    }

    async fn delete_user_cascade(&self, user_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM billing_audit_log WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut tx)
            .await?;
        sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut tx)
            .await?;
        let removed = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&mut tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }
}
