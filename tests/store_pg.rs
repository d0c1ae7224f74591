use chrono::{Duration, TimeZone, Utc};
use promptaat_billing::billing::{
    AuditAction, AuditNote, AuditSource, NewSubscription, PgSubscriptionStore, SubscriptionMirror,
    SubscriptionStatus, SubscriptionStore,
};
use serde_json::json;
use sqlx::PgPool;

async fn seed_user(pool: &PgPool, id: &str, email: &str) {
    sqlx::query("INSERT INTO users (id, email, name) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(email)
        .bind("Seeded User")
        .execute(pool)
        .await
        .unwrap();
}

fn new_subscription(user_id: &str, external_id: &str, status: SubscriptionStatus) -> NewSubscription {
    let start = Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap();
    NewSubscription {
        user_id: user_id.to_string(),
        external_subscription_id: external_id.to_string(),
        external_customer_id: "cus_1".into(),
        external_price_id: Some("price_pro_m".into()),
        plan: "pro".into(),
        interval: "monthly".into(),
        mirror: SubscriptionMirror {
            status,
            cancel_at_period_end: false,
            current_period_start: start,
            current_period_end: start + Duration::days(30),
        },
    }
}

fn note(action: AuditAction) -> AuditNote {
    AuditNote::new(AuditSource::Reconciler, action, json!({ "test": true }))
}

// key: store-tests -> upsert, mirror, soft-cancel, cascade
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn insert_mirror_and_soft_cancel_round_trip(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_user(&pool, "u1", "Owner@Example.com").await;
    let store = PgSubscriptionStore::new(pool.clone());

    let created = store
        .insert_subscription(
            &new_subscription("u1", "sub_1", SubscriptionStatus::Active),
            &note(AuditAction::Created),
        )
        .await
        .unwrap()
        .subscription;
    assert_eq!(created.status, SubscriptionStatus::Active);

    let listed = store.list_subscriptions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].owner.email, "Owner@Example.com");

    let mut mirror = created.mirror();
    mirror.status = SubscriptionStatus::PastDue;
    let mirrored = store
        .apply_mirror(created.id, &mirror, &note(AuditAction::Mirrored))
        .await
        .unwrap();
    assert_eq!(mirrored.status, SubscriptionStatus::PastDue);
    assert_eq!(mirrored.plan, "pro");

    let canceled = store
        .soft_cancel(created.id, &note(AuditAction::SoftCanceled))
        .await
        .unwrap();
    assert_eq!(canceled.id, created.id);
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(canceled.cancel_at_period_end);
    assert_eq!(canceled.current_period_end, created.current_period_end);

    let trail = store.audit_trail("u1").await.unwrap();
    assert_eq!(trail.len(), 3);
    assert!(trail.iter().all(|entry| entry.subscription_id == Some(created.id)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_creation_converges_on_one_row(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_user(&pool, "u1", "u1@example.com").await;
    let store = PgSubscriptionStore::new(pool.clone());

    let first = store
        .insert_subscription(
            &new_subscription("u1", "sub_1", SubscriptionStatus::Incomplete),
            &note(AuditAction::Created),
        )
        .await
        .unwrap();
    let second = store
        .insert_subscription(
            &new_subscription("u1", "sub_1", SubscriptionStatus::Active),
            &note(AuditAction::Created),
        )
        .await
        .unwrap();

    assert!(first.inserted);
    assert!(!second.inserted);
    assert_eq!(first.subscription.id, second.subscription.id);
    assert_eq!(second.subscription.status, SubscriptionStatus::Active);
    assert_eq!(store.subscriptions_for_user("u1").await.unwrap().len(), 1);

    let mut actions: Vec<String> = store
        .audit_trail("u1")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    actions.sort();
    assert_eq!(actions, vec!["created", "mirrored"]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn owner_lookup_by_external_customer_picks_newest_row(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_user(&pool, "u1", "u1@example.com").await;
    let store = PgSubscriptionStore::new(pool.clone());
    store
        .insert_subscription(
            &new_subscription("u1", "sub_1", SubscriptionStatus::Canceled),
            &note(AuditAction::Created),
        )
        .await
        .unwrap();

    let owner = store
        .find_user_by_external_customer("cus_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner.id, "u1");
    assert!(store
        .find_user_by_external_customer("cus_unknown")
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn user_lookup_and_webhook_ledger(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_user(&pool, "u1", "Mixed@Example.com").await;
    let store = PgSubscriptionStore::new(pool.clone());

    let by_email = store
        .find_user_by_email("mixed@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_email.id, "u1");
    assert!(store.find_user("missing").await.unwrap().is_none());

    assert!(!store.webhook_event_processed("evt_1").await.unwrap());
    store
        .mark_webhook_event_processed("evt_1", "customer.subscription.created")
        .await
        .unwrap();
    store
        .mark_webhook_event_processed("evt_1", "customer.subscription.created")
        .await
        .unwrap();
    assert!(store.webhook_event_processed("evt_1").await.unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn account_deletion_cascades(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_user(&pool, "u1", "u1@example.com").await;
    seed_user(&pool, "u2", "u2@example.com").await;
    let store = PgSubscriptionStore::new(pool.clone());
    store
        .insert_subscription(
            &new_subscription("u1", "sub_1", SubscriptionStatus::Active),
            &note(AuditAction::Created),
        )
        .await
        .unwrap();
    store
        .insert_subscription(
            &new_subscription("u2", "sub_2", SubscriptionStatus::Active),
            &note(AuditAction::Created),
        )
        .await
        .unwrap();

    assert!(store.delete_user_cascade("u1").await.unwrap());
    assert!(!store.delete_user_cascade("u1").await.unwrap());

    assert!(store.find_user("u1").await.unwrap().is_none());
    assert!(store.subscriptions_for_user("u1").await.unwrap().is_empty());
    assert!(store.audit_trail("u1").await.unwrap().is_empty());
    assert_eq!(store.subscriptions_for_user("u2").await.unwrap().len(), 1);
}
