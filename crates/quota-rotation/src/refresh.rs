//! Periodic quota refresh
//!
//! Keeps the state table warm while the service runs: drop stale entries,
//! then fetch quota for the last selected model. Failures are logged and the
//! next cycle is scheduled regardless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::RotationController;
use crate::error::Error;

/// Shortest interval the backend tolerates between polls.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Spawn the refresh loop. It stops once `shutdown` flips to `true` or its
/// sender is dropped.
///
/// `interval` is raised to `MIN_REFRESH_INTERVAL` when shorter.
pub fn spawn_quota_refresh(
    controller: Arc<RotationController>,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_REFRESH_INTERVAL);
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "quota refresh started");
        let mut delay = INITIAL_DELAY;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            // A fetch in flight is dropped on shutdown; nothing is ingested
            // until it completes, so no partial state is left behind.
            tokio::select! {
                _ = refresh_once(&controller, stale_after) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("quota refresh abandoned in flight");
                    break;
                }
            }
            delay = interval;
        }
        info!("quota refresh stopped");
    })
}

async fn refresh_once(controller: &RotationController, stale_after: Duration) {
    let evicted = controller.table().evict_stale(stale_after);
    if evicted > 0 {
        debug!(evicted, "dropped stale quota entries");
    }
    match controller.get_quota(None).await {
        Ok(quota) => debug!(
            model = %quota.id,
            remaining_fraction = quota.record.remaining_fraction,
            "quota refreshed"
        ),
        Err(Error::NoQuotaData(model)) => debug!(model = %model, "quota refresh found no data"),
        Err(e) => warn!(error = %e, kind = e.kind(), "quota refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{QuotaSnapshot, QuotaSource};
    use crate::selector::{ModelSelector, RotationStrategy};
    use crate::table::QuotaStateTable;
    use crate::test_support::{Reply, ScriptedSource, model, rotator};
    use cloudcode_auth::Account;
    use std::future::Future;
    use std::pin::Pin;

    /// Backend that never answers.
    struct HangingSource;

    impl QuotaSource for HangingSource {
        fn fetch_all<'a>(
            &'a self,
            _account: &'a Account,
        ) -> Pin<Box<dyn Future<Output = crate::Result<QuotaSnapshot>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    fn controller(source: &Arc<ScriptedSource>) -> Arc<RotationController> {
        let table = Arc::new(QuotaStateTable::default());
        let selector = Arc::new(ModelSelector::new(table.clone(), RotationStrategy::default()));
        let source: Arc<dyn QuotaSource> = source.clone();
        Arc::new(RotationController::new(rotator(&["t1"]), table, selector, source))
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_start_and_each_interval() {
        let source = ScriptedSource::new();
        source.set("t1", Reply::Models(vec![model("A", 0.4)]));
        let controller = controller(&source);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_quota_refresh(
            controller.clone(),
            MIN_REFRESH_INTERVAL,
            Duration::from_secs(300),
            rx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls().len(), 1);
        assert_eq!(controller.table().get("A").unwrap().remaining_fraction, 0.4);

        tokio::time::sleep(MIN_REFRESH_INTERVAL).await;
        assert_eq!(source.calls().len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn short_interval_is_raised_to_minimum() {
        let source = ScriptedSource::new();
        let controller = controller(&source);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_quota_refresh(
            controller,
            Duration::from_secs(5),
            Duration::from_secs(300),
            rx,
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls().len(), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let source = ScriptedSource::new();
        source.set("t1", Reply::Transient);
        let controller = controller(&source);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_quota_refresh(
            controller,
            MIN_REFRESH_INTERVAL,
            Duration::from_secs(300),
            rx,
        );

        tokio::time::sleep(MIN_REFRESH_INTERVAL * 2 + Duration::from_secs(1)).await;
        assert_eq!(source.calls().len(), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_hanging_refresh() {
        let table = Arc::new(QuotaStateTable::default());
        let selector = Arc::new(ModelSelector::new(table.clone(), RotationStrategy::default()));
        let controller = Arc::new(RotationController::new(
            rotator(&["t1", "t2"]),
            table,
            selector,
            Arc::new(HangingSource),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_quota_refresh(
            controller.clone(),
            MIN_REFRESH_INTERVAL,
            Duration::from_secs(300),
            rx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(3600), handle)
            .await
            .expect("refresh task must stop once shutdown is signalled")
            .unwrap();
        assert_eq!(controller.rotator().current().await.unwrap().index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_first_cycle_skips_refresh() {
        let source = ScriptedSource::new();
        let (tx, rx) = watch::channel(true);

        let handle = spawn_quota_refresh(
            controller(&source),
            MIN_REFRESH_INTERVAL,
            Duration::from_secs(300),
            rx,
        );
        handle.await.unwrap();
        assert!(source.calls().is_empty());
        drop(tx);
    }
}
