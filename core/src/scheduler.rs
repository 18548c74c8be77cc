//! Keeps the staged queue topped up.
//!
//! One task watches demand. Below capacity it first tries to roll and
//! clone existing work, otherwise picks a pool through the strategy and
//! spawns a fetch. Fetch results are staged; failures count towards
//! declaring the pool dead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::engine::EngineContext;
use crate::pool::Pool;

/// Upper bound on any single wait so shutdown and pool changes are noticed.
const IDLE_WAIT: Duration = Duration::from_secs(5);
const FAIL_PAUSE: Duration = Duration::from_secs(1);

/// How many jobs should be staged or in flight right now.
fn max_staged(ctx: &EngineContext) -> usize {
    let mut max = ctx.tuning.queue_depth;
    if !ctx.pools.current().can_generate_locally() && ctx.queue.rollable() == 0 {
        max += ctx.tuning.worker_threads;
    }
    max
}

pub(crate) async fn run(ctx: Arc<EngineContext>) {
    let mut pool_changes = ctx.pools.subscribe();
    let cancel = ctx.cancel_token().clone();
    debug!("Scheduler started");

    while !cancel.is_cancelled() {
        let wanted = max_staged(&ctx);
        if ctx.queue.len() + ctx.queued() >= wanted {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ctx.queue.wait_for_demand(IDLE_WAIT) => {}
            }
            continue;
        }

        if ctx.queue.clone_available(|job| ctx.can_roll(job) && ctx.should_roll(job)) {
            continue;
        }

        if !ctx.pools.any_usable() {
            debug!("No usable pools, waiting for a change");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::timeout(IDLE_WAIT, pool_changes.changed()) => {}
            }
            continue;
        }

        let current = ctx.pools.current();
        let lagging = !current.can_generate_locally() && ctx.queue.is_empty() && !ctx.tuning.fail_only;
        if lagging && !current.set_lagging(true) {
            warn!("Pool {} not providing work fast enough", current.id);
            ctx.stats.record_lagging(current.id);
        }

        let pool = ctx.pools.select_pool(lagging);
        ctx.begin_request();
        tokio::spawn(fetch(Arc::clone(&ctx), pool));
        tokio::task::yield_now().await;
    }
    debug!("Scheduler stopped");
}

async fn fetch(ctx: Arc<EngineContext>, pool: Arc<Pool>) {
    let started = Instant::now();
    let result = tokio::select! {
        _ = ctx.cancel_token().cancelled() => {
            ctx.end_request();
            return;
        }
        result = pool.client().fetch_job(&pool) => result,
    };

    match result {
        Ok(job) => {
            pool.record_work(started.elapsed());
            ctx.stats.record_getwork(pool.id);
            if pool.set_lagging(false) {
                debug!("Pool {} caught up", pool.id);
            }
            if pool.is_idle() {
                ctx.pools.mark_recovered(pool.id);
            }
            ctx.stage_job(job);
            ctx.end_request();
        }
        Err(e) => {
            let fails = pool.bump_getfails();
            ctx.stats.record_get_failure(pool.id);
            debug!("Work request to pool {} failed: {}", pool.id, e);
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {}
                _ = tokio::time::sleep(FAIL_PAUSE) => {}
            }
            let limit = ctx.tuning.worker_threads + ctx.tuning.queue_depth;
            if fails as usize > limit && ctx.pools.mark_dead(pool.id) {
                info!("Pool {} declared dead after {} failed requests", pool.id, fails);
                ctx.discard_stale();
            }
            ctx.end_request();
            ctx.queue.signal_demand();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::config::{EngineConfig, Tuning};
    use crate::job::ProtocolKind;
    use crate::pool::{PoolSet, Strategy};
    use crate::protocol::ProtocolClient;
    use crate::testing::{test_pool_with, MockClient};

    fn context(clients: &[Arc<MockClient>], queue_depth: usize, fail_only: bool) -> Arc<EngineContext> {
        let config = EngineConfig {
            queue_depth,
            fail_only,
            ..EngineConfig::default()
        };
        let tuning = Tuning::from_config(&config).unwrap();
        let entries = clients
            .iter()
            .enumerate()
            .map(|(i, c)| (test_pool_with(i, Arc::clone(c) as Arc<dyn ProtocolClient>), 1, true))
            .collect();
        let set = PoolSet::new(entries, Strategy::Failover, fail_only).unwrap();
        Arc::new(EngineContext::new(tuning, set).unwrap())
    }

    async fn settle<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..600 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_fills_queue_to_depth() {
        let client = Arc::new(MockClient::new(ProtocolKind::Poll));
        let ctx = context(&[Arc::clone(&client)], 3, false);
        let task = tokio::spawn(run(Arc::clone(&ctx)));

        // polling pool without rolling: depth plus one per worker thread
        assert!(settle(|| ctx.queue.len() == 4).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.queue.len(), 4);
        assert_eq!(ctx.stats.pool(0).getworks, 4);

        ctx.request_shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rolling_work_is_cloned_not_fetched() {
        let client = Arc::new(MockClient::new(ProtocolKind::Poll).rolling(Duration::from_secs(60)));
        let ctx = context(&[Arc::clone(&client)], 2, false);
        let task = tokio::spawn(run(Arc::clone(&ctx)));

        assert!(settle(|| ctx.queue.len() >= 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // from here on any fetch would fail and show up as a get failure
        client.fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(ctx.queue.pop(Duration::ZERO).is_some());
            assert!(settle(|| ctx.queue.len() >= 2).await);
        }
        assert_eq!(ctx.stats.pool(0).get_failures, 0);

        ctx.request_shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_pool_declared_dead() {
        let bad = Arc::new(MockClient::new(ProtocolKind::Poll));
        bad.fail.store(true, Ordering::SeqCst);
        let good = Arc::new(MockClient::new(ProtocolKind::Poll));
        let ctx = context(&[Arc::clone(&bad), Arc::clone(&good)], 1, true);
        let task = tokio::spawn(run(Arc::clone(&ctx)));

        assert!(settle(|| ctx.pools.get(0).unwrap().is_idle()).await);
        assert_eq!(ctx.pools.current_id(), 1);
        assert!(settle(|| !ctx.queue.is_empty()).await);
        assert!(ctx.stats.pool(0).get_failures > 2);

        ctx.request_shutdown();
        task.await.unwrap();
    }
}
