pub mod actions;
pub mod api;
pub mod audit;
pub mod matching;
pub mod models;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod stripe;
pub mod sync;
pub mod webhook;

pub use actions::{
    ActionError, CheckoutConfig, PriceCatalog, PriceEntry, PriceSelection,
    SubscriptionActionService,
};
pub use api::{BillingContext, WebhookConfig};
pub use audit::{AuditAction, AuditNote, AuditSource, BillingAuditEntry};
pub use models::{
    BillingUser, NewSubscription, OwnedSubscription, Subscription, SubscriptionMirror,
    SubscriptionStatus, UnknownStatus, UpsertedSubscription,
};
pub use provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, ExternalCustomer, ExternalSubscription,
    ExternalSubscriptionSummary, ProviderError,
};
pub use reconciler::{FixLedger, ReconciliationReport, ReconciliationStats, Reconciler};
pub use retry::RetryConfig;
pub use scheduler::{process_tick as run_reconciliation_tick, spawn as spawn_reconcile_scheduler};
pub use store::{current_subscription, PgSubscriptionStore, SubscriptionStore};
pub use stripe::StripeClient;
pub use sync::{SubscriptionSync, SyncOutcome};
pub use webhook::{WebhookError, WebhookEventHandler, WebhookOutcome};
