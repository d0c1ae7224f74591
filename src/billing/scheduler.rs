use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

use super::reconciler::{ReconciliationStats, Reconciler};

/// key: billing-reconcile-scheduler -> in-process alternative to the cron trigger
pub fn spawn(reconciler: Arc<Reconciler>, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "starting billing reconciliation scheduler");
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&reconciler).await {
                warn!(?err, "billing reconciliation tick failed");
            }
        }
    })
}

/// key: billing-reconcile-scheduler -> tick handler
pub async fn process_tick(reconciler: &Reconciler) -> Result<ReconciliationStats> {
    let report = reconciler.run().await?;
    if !report.ledger.failed.is_empty() {
        warn!(
            failed = report.ledger.failed.len(),
            "scheduled reconciliation left rows unfixed"
        );
    }
    Ok(report.stats)
}
