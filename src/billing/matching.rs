use std::collections::HashMap;

use anyhow::Result;

use super::models::{BillingUser, OwnedSubscription};
use super::provider::{ExternalCustomer, ExternalSubscription};
use super::store::SubscriptionStore;

/// key: billing-index -> external subscriptions by processor id
pub fn index_external(
    subscriptions: &[ExternalSubscription],
) -> HashMap<&str, &ExternalSubscription> {
    subscriptions
        .iter()
        .map(|subscription| (subscription.id.as_str(), subscription))
        .collect()
}

/// Local rows without an external id are still pending confirmation and are
/// left out of the index.
pub fn index_local(subscriptions: &[OwnedSubscription]) -> HashMap<&str, &OwnedSubscription> {
    subscriptions
        .iter()
        .filter_map(|owned| {
            owned
                .subscription
                .external_subscription_id
                .as_deref()
                .map(|external_id| (external_id, owned))
        })
        .collect()
}

/// key: billing-diff -> classified drift between both systems
#[derive(Debug, Default)]
pub struct SubscriptionDiff<'a> {
    pub missing_locally: Vec<&'a ExternalSubscription>,
    pub missing_externally: Vec<&'a OwnedSubscription>,
    pub status_mismatches: Vec<(&'a OwnedSubscription, &'a ExternalSubscription)>,
}

impl SubscriptionDiff<'_> {
    pub fn is_empty(&self) -> bool {
        self.missing_locally.is_empty()
            && self.missing_externally.is_empty()
            && self.status_mismatches.is_empty()
    }
}

pub fn classify<'a>(
    external: &'a [ExternalSubscription],
    local: &'a [OwnedSubscription],
) -> SubscriptionDiff<'a> {
    let external_index = index_external(external);
    let local_index = index_local(local);
    let mut diff = SubscriptionDiff::default();

    for subscription in external {
        if !local_index.contains_key(subscription.id.as_str()) {
            diff.missing_locally.push(subscription);
        }
    }

    for owned in local {
        let Some(external_id) = owned.subscription.external_subscription_id.as_deref() else {
            continue;
        };
        match external_index.get(external_id) {
            None => diff.missing_externally.push(owned),
            Some(remote) => {
                if owned.subscription.status.as_str() != remote.status {
                    diff.status_mismatches.push((owned, *remote));
                }
            }
        }
    }

    diff
}

/// key: billing-owner-hint -> candidate owner produced by a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerHint {
    UserId(String),
    Email(String),
    /// Processor customer already billed for another local row.
    CustomerId(String),
}

pub type OwnerResolver = fn(&ExternalSubscription, Option<&ExternalCustomer>) -> Option<OwnerHint>;

pub fn from_subscription_metadata(
    subscription: &ExternalSubscription,
    _customer: Option<&ExternalCustomer>,
) -> Option<OwnerHint> {
    subscription
        .user_id()
        .map(|user_id| OwnerHint::UserId(user_id.to_string()))
}

pub fn from_customer_metadata(
    _subscription: &ExternalSubscription,
    customer: Option<&ExternalCustomer>,
) -> Option<OwnerHint> {
    customer
        .and_then(ExternalCustomer::user_id)
        .map(|user_id| OwnerHint::UserId(user_id.to_string()))
}

pub fn from_customer_email(
    _subscription: &ExternalSubscription,
    customer: Option<&ExternalCustomer>,
) -> Option<OwnerHint> {
    customer
        .and_then(ExternalCustomer::live_email)
        .map(|email| OwnerHint::Email(email.to_string()))
}

/// Works on bare customer ids, which is all a webhook payload carries.
pub fn from_known_customer(
    subscription: &ExternalSubscription,
    customer: Option<&ExternalCustomer>,
) -> Option<OwnerHint> {
    if customer.map_or(false, |customer| customer.deleted) {
        return None;
    }
    let customer_id = subscription.customer_id().trim();
    (!customer_id.is_empty()).then(|| OwnerHint::CustomerId(customer_id.to_string()))
}

/// Tried in order; the first hint naming a known local user wins.
pub const OWNER_RESOLVERS: [(&str, OwnerResolver); 4] = [
    ("subscription_metadata", from_subscription_metadata),
    ("customer_metadata", from_customer_metadata),
    ("customer_email", from_customer_email),
    ("known_customer", from_known_customer),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    pub user: BillingUser,
    pub strategy: &'static str,
}

pub async fn resolve_owner(
    store: &dyn SubscriptionStore,
    subscription: &ExternalSubscription,
) -> Result<Option<ResolvedOwner>> {
    let customer = subscription.customer();
    for (strategy, resolver) in OWNER_RESOLVERS {
        let Some(hint) = resolver(subscription, customer) else {
            continue;
        };
        let user = match &hint {
            OwnerHint::UserId(user_id) => store.find_user(user_id).await?,
            OwnerHint::Email(email) => store.find_user_by_email(email).await?,
            OwnerHint::CustomerId(customer_id) => {
                store.find_user_by_external_customer(customer_id).await?
            }
        };
        match user {
            Some(user) => return Ok(Some(ResolvedOwner { user, strategy })),
            None => tracing::debug!(
                subscription = %subscription.id,
                strategy,
                ?hint,
                "owner hint does not match a local user"
            ),
        }
    }
    Ok(None)
}
