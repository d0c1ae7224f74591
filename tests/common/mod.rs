#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use promptaat_billing::billing::provider::{
    CustomerRef, ExternalPage, ItemPrice, SubscriptionItem, SubscriptionItems, METADATA_USER_ID,
};
use promptaat_billing::billing::{
    AuditAction, AuditNote, BillingProvider, BillingUser, CheckoutRequest, CheckoutSession,
    ExternalCustomer, ExternalSubscription, NewSubscription, OwnedSubscription, ProviderError,
    Subscription, SubscriptionMirror, SubscriptionStatus, SubscriptionStore, UpsertedSubscription,
};

/// Whole seconds, so values survive the processor's unix timestamps.
pub fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

pub fn user(id: &str) -> BillingUser {
    BillingUser {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        name: None,
    }
}

pub fn local_row(user_id: &str, external_id: &str, status: SubscriptionStatus) -> Subscription {
    let now = now();
    Subscription {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        external_subscription_id: Some(external_id.to_string()),
        external_customer_id: Some(format!("cus_{user_id}")),
        external_price_id: Some("price_pro_m".into()),
        plan: "pro".into(),
        interval: "monthly".into(),
        status,
        cancel_at_period_end: false,
        current_period_start: now - Duration::days(3),
        current_period_end: now + Duration::days(27),
        created_at: now - Duration::days(3),
        updated_at: now - Duration::days(3),
    }
}

pub fn external(id: &str, status: &str) -> ExternalSubscription {
    let now = now();
    ExternalSubscription {
        id: id.to_string(),
        customer: CustomerRef::Id(format!("cus_for_{id}")),
        status: status.to_string(),
        cancel_at_period_end: false,
        current_period_start: now - Duration::days(1),
        current_period_end: now + Duration::days(29),
        metadata: BTreeMap::new(),
        items: SubscriptionItems {
            data: vec![SubscriptionItem {
                price: Some(ItemPrice {
                    id: "price_pro_m".into(),
                }),
            }],
        },
    }
}

pub fn with_user_metadata(mut subscription: ExternalSubscription, user_id: &str) -> ExternalSubscription {
    subscription
        .metadata
        .insert(METADATA_USER_ID.to_string(), user_id.to_string());
    subscription
}

pub fn with_customer(
    mut subscription: ExternalSubscription,
    email: Option<&str>,
    user_id: Option<&str>,
) -> ExternalSubscription {
    let customer_id = subscription.customer_id().to_string();
    subscription.customer = CustomerRef::Expanded(ExternalCustomer {
        id: customer_id,
        email: email.map(str::to_string),
        metadata: user_id
            .map(|id| BTreeMap::from([(METADATA_USER_ID.to_string(), id.to_string())]))
            .unwrap_or_default(),
        deleted: false,
    });
    subscription
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub subscription_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub note: AuditNote,
}

#[derive(Default)]
struct MemoryState {
    users: Vec<BillingUser>,
    subscriptions: Vec<Subscription>,
    audit: Vec<AuditRecord>,
    processed_events: Vec<(String, String)>,
    failing_writes: HashSet<String>,
}

/// In-memory `SubscriptionStore`; writes for ids in the failing set error out.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: BillingUser) {
        self.state.lock().unwrap().users.push(user);
    }

    pub fn add_subscription(&self, subscription: Subscription) -> Subscription {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push(subscription.clone());
        subscription
    }

    pub fn fail_writes_for(&self, external_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(external_id.to_string());
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn by_external_id(&self, external_id: &str) -> Option<Subscription> {
        self.subscriptions()
            .into_iter()
            .find(|row| row.external_subscription_id.as_deref() == Some(external_id))
    }

    pub fn audit(&self) -> Vec<AuditRecord> {
        self.state.lock().unwrap().audit.clone()
    }

    pub fn processed_events(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .processed_events
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn write_row(
        &self,
        subscription_id: Uuid,
        note: &AuditNote,
        change: impl FnOnce(&mut Subscription),
    ) -> Result<Subscription> {
        let mut state = self.state.lock().unwrap();
        let failing = state.failing_writes.clone();
        let row = state
            .subscriptions
            .iter_mut()
            .find(|row| row.id == subscription_id)
            .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
        if let Some(external_id) = &row.external_subscription_id {
            if failing.contains(external_id) {
                return Err(anyhow!("simulated write failure for {external_id}"));
            }
        }
        change(row);
        row.updated_at = Utc::now();
        let updated = row.clone();
        state.audit.push(AuditRecord {
            subscription_id: Some(updated.id),
            user_id: Some(updated.user_id.clone()),
            note: note.clone(),
        });
        Ok(updated)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn list_subscriptions(&self) -> Result<Vec<OwnedSubscription>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .filter_map(|row| {
                state
                    .users
                    .iter()
                    .find(|user| user.id == row.user_id)
                    .map(|owner| OwnedSubscription {
                        subscription: row.clone(),
                        owner: owner.clone(),
                    })
            })
            .collect())
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self.by_external_id(external_subscription_id))
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let mut rows: Vec<Subscription> = self
            .subscriptions()
            .into_iter()
            .filter(|row| row.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<BillingUser>> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|user| user.id == user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<BillingUser>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .find(|user| user.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    async fn find_user_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> Result<Option<BillingUser>> {
        let state = self.state.lock().unwrap();
        let newest = state
            .subscriptions
            .iter()
            .filter(|row| row.external_customer_id.as_deref() == Some(external_customer_id))
            .max_by_key(|row| row.created_at);
        Ok(newest.and_then(|row| {
            state
                .users
                .iter()
                .find(|user| user.id == row.user_id)
                .cloned()
        }))
    }

    async fn insert_subscription(
        &self,
        record: &NewSubscription,
        note: &AuditNote,
    ) -> Result<UpsertedSubscription> {
        if let Some(existing) = self.by_external_id(&record.external_subscription_id) {
            let mirror = record.mirror;
            let note = note.clone().with_action(AuditAction::Mirrored);
            let subscription = self.write_row(existing.id, &note, |row| apply(row, &mirror))?;
            return Ok(UpsertedSubscription {
                subscription,
                inserted: false,
            });
        }
        let mut state = self.state.lock().unwrap();
        if state
            .failing_writes
            .contains(&record.external_subscription_id)
        {
            return Err(anyhow!(
                "simulated write failure for {}",
                record.external_subscription_id
            ));
        }
        let now = Utc::now();
        let created = Subscription {
            id: Uuid::new_v4(),
            user_id: record.user_id.clone(),
            external_subscription_id: Some(record.external_subscription_id.clone()),
            external_customer_id: Some(record.external_customer_id.clone()),
            external_price_id: record.external_price_id.clone(),
            plan: record.plan.clone(),
            interval: record.interval.clone(),
            status: record.mirror.status,
            cancel_at_period_end: record.mirror.cancel_at_period_end,
            current_period_start: record.mirror.current_period_start,
            current_period_end: record.mirror.current_period_end,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(created.clone());
        state.audit.push(AuditRecord {
            subscription_id: Some(created.id),
            user_id: Some(created.user_id.clone()),
            note: note.clone(),
        });
        Ok(UpsertedSubscription {
            subscription: created,
            inserted: true,
        })
    }

    async fn apply_mirror(
        &self,
        subscription_id: Uuid,
        mirror: &SubscriptionMirror,
        note: &AuditNote,
    ) -> Result<Subscription> {
        self.write_row(subscription_id, note, |row| apply(row, mirror))
    }

    async fn soft_cancel(&self, subscription_id: Uuid, note: &AuditNote) -> Result<Subscription> {
        self.write_row(subscription_id, note, |row| {
            row.status = SubscriptionStatus::Canceled;
            row.cancel_at_period_end = true;
        })
    }

    async fn record_audit(
        &self,
        subscription_id: Option<Uuid>,
        user_id: Option<&str>,
        note: &AuditNote,
    ) -> Result<()> {
        self.state.lock().unwrap().audit.push(AuditRecord {
            subscription_id,
            user_id: user_id.map(str::to_string),
            note: note.clone(),
        });
        Ok(())
    }

    async fn webhook_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .processed_events
            .iter()
            .any(|(id, _)| id == event_id))
    }

    async fn mark_webhook_event_processed(&self, event_id: &str, event_type: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.processed_events.iter().any(|(id, _)| id == event_id) {
            state
                .processed_events
                .push((event_id.to_string(), event_type.to_string()));
        }
        Ok(())
    }

    async fn delete_user_cascade(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.retain(|row| row.user_id != user_id);
        state
            .audit
            .retain(|entry| entry.user_id.as_deref() != Some(user_id));
        let before = state.users.len();
        state.users.retain(|user| user.id != user_id);
        Ok(state.users.len() < before)
    }
}

fn apply(row: &mut Subscription, mirror: &SubscriptionMirror) {
    row.status = mirror.status;
    row.cancel_at_period_end = mirror.cancel_at_period_end;
    row.current_period_start = mirror.current_period_start;
    row.current_period_end = mirror.current_period_end;
}

#[derive(Default)]
struct ProviderState {
    subscriptions: Vec<ExternalSubscription>,
    customers: Vec<ExternalCustomer>,
    calls: Vec<String>,
    list_cursors: Vec<Option<String>>,
    checkouts: Vec<CheckoutRequest>,
    fail_listing_at_page: Option<usize>,
}

/// Scripted `BillingProvider` that records every call it receives.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: Vec<ExternalSubscription>) -> Self {
        let provider = Self::default();
        provider.state.lock().unwrap().subscriptions = subscriptions;
        provider
    }

    pub fn add_customer(&self, customer: ExternalCustomer) {
        self.state.lock().unwrap().customers.push(customer);
    }

    pub fn remove_subscription(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .retain(|subscription| subscription.id != id);
    }

    /// Zero-based page index whose request fails with a 500.
    pub fn fail_listing_at_page(&self, page: usize) {
        self.state.lock().unwrap().fail_listing_at_page = Some(page);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn list_cursors(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().list_cursors.clone()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.state.lock().unwrap().checkouts.clone()
    }

    pub fn customers(&self) -> Vec<ExternalCustomer> {
        self.state.lock().unwrap().customers.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn not_found(id: &str) -> ProviderError {
        ProviderError::Api {
            status: 404,
            message: format!("No such subscription: '{id}'"),
            code: Some("resource_missing".into()),
        }
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
        limit: u32,
    ) -> Result<ExternalPage<ExternalSubscription>, ProviderError> {
        self.record("list_subscriptions".into());
        let mut state = self.state.lock().unwrap();
        let page_index = state.list_cursors.len();
        state
            .list_cursors
            .push(starting_after.map(str::to_string));
        if state.fail_listing_at_page == Some(page_index) {
            return Err(ProviderError::Api {
                status: 500,
                message: "listing unavailable".into(),
                code: None,
            });
        }
        let start = match starting_after {
            Some(cursor) => state
                .subscriptions
                .iter()
                .position(|subscription| subscription.id == cursor)
                .map(|index| index + 1)
                .unwrap_or(state.subscriptions.len()),
            None => 0,
        };
        let end = (start + limit as usize).min(state.subscriptions.len());
        Ok(ExternalPage {
            data: state.subscriptions[start..end].to_vec(),
            has_more: end < state.subscriptions.len(),
        })
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<ExternalCustomer>, ProviderError> {
        self.record(format!("find_customer_by_email:{email}"));
        Ok(self
            .state
            .lock()
            .unwrap()
            .customers
            .iter()
            .find(|customer| customer.email.as_deref() == Some(email))
            .cloned())
    }

    async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError> {
        self.record(format!("create_customer:{email}"));
        let customer = ExternalCustomer {
            id: format!("cus_new_{user_id}"),
            email: Some(email.to_string()),
            metadata: BTreeMap::from([(METADATA_USER_ID.to_string(), user_id.to_string())]),
            deleted: false,
        };
        self.state.lock().unwrap().customers.push(customer.clone());
        Ok(customer)
    }

    async fn tag_customer_user(
        &self,
        customer_id: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError> {
        self.record(format!("tag_customer_user:{customer_id}"));
        let mut state = self.state.lock().unwrap();
        let customer = state
            .customers
            .iter_mut()
            .find(|customer| customer.id == customer_id)
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("No such customer: '{customer_id}'"),
                code: Some("resource_missing".into()),
            })?;
        customer
            .metadata
            .insert(METADATA_USER_ID.to_string(), user_id.to_string());
        Ok(customer.clone())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        self.record("create_checkout_session".into());
        let mut state = self.state.lock().unwrap();
        state.checkouts.push(request.clone());
        let id = format!("cs_test_{}", state.checkouts.len());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.example.com/c/pay/{id}")),
            id,
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<ExternalSubscription, ProviderError> {
        self.record(format!(
            "set_cancel_at_period_end:{subscription_id}:{cancel_at_period_end}"
        ));
        let mut state = self.state.lock().unwrap();
        let subscription = state
            .subscriptions
            .iter_mut()
            .find(|subscription| subscription.id == subscription_id)
            .ok_or_else(|| Self::not_found(subscription_id))?;
        subscription.cancel_at_period_end = cancel_at_period_end;
        Ok(subscription.clone())
    }
}
