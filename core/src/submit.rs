//! Getting found nonces to the pool and accounting for the verdicts.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::difficulty;
use crate::engine::EngineContext;
use crate::job::{Job, ProtocolKind};
use crate::pool::{Pool, PoolStatus};
use crate::protocol::SubmitOutcome;

/// Consecutive rejects a pool must exceed before it can be auto-disabled.
const REJECT_RUN: u32 = 10;

/// Floor on the pause between submission retries.
const MIN_RESUBMIT_PAUSE: Duration = Duration::from_secs(1);

impl EngineContext {
    /// Check a nonce against its job and send the share off in the
    /// background. False if the hash misses the job target.
    pub fn submit_nonce(self: &Arc<Self>, job: &Job, nonce: u32, worker: Option<usize>) -> bool {
        let mut share = job.clone();
        share.worker = worker.or(job.worker);
        share.set_nonce(nonce);
        let hash = share.hash();

        if !difficulty::hash_meets_target(&hash, &share.target) {
            debug!("Nonce {:08x} misses target on job {}", nonce, job.id);
            self.stats.record_hw_error(share.worker);
            return false;
        }

        let share_diff = difficulty::hash_difficulty(&hash);
        if self.stats.record_best_share(share_diff) {
            debug!("New best share: {:.0}", share_diff);
        }

        if share.protocol != ProtocolKind::Benchmark
            && difficulty::hash_meets_target(&hash, &difficulty::compact_to_target(share.nbits()))
        {
            info!("Found block for pool {}!", share.pool.id);
            share.mandatory = true;
            share.likely_block = true;
            self.stats.record_found_block();
            self.restart_workers();
        }

        let ctx = Arc::clone(self);
        self.runtime().spawn(async move { ctx.dispatch(share).await });
        true
    }

    async fn dispatch(self: Arc<Self>, share: Job) {
        let pool = Arc::clone(&share.pool);
        let may_send_stale = self.tuning.submit_stale || pool.submit_old || share.mandatory;

        if self.is_stale(&share, true) {
            if !may_send_stale {
                debug!("Share on job {} is stale, not submitting", share.id);
                self.stats.record_stale(pool.id, share.worker, share.difficulty);
                return;
            }
            debug!("Submitting stale share to pool {}", pool.id);
        }

        let mut failures: i32 = 0;
        loop {
            match pool.client().submit(&share).await {
                Ok(SubmitOutcome::Pending) => return,
                Ok(SubmitOutcome::Accepted) => {
                    self.share_result(&pool, Some(&share), true, None, share.difficulty);
                    return;
                }
                Ok(SubmitOutcome::Rejected(reason)) => {
                    self.share_result(&pool, Some(&share), false, reason.as_deref(), share.difficulty);
                    return;
                }
                Err(e) => {
                    warn!("Share submission to pool {} failed: {}", pool.id, e);
                    self.stats.record_remote_failure(pool.id);
                    if self.tuning.low_resource {
                        self.stats.record_dropped(pool.id);
                        return;
                    }
                    if self.is_stale(&share, true) && !share.mandatory {
                        info!("Share on job {} went stale while retrying, discarding", share.id);
                        self.stats.record_stale(pool.id, share.worker, share.difficulty);
                        return;
                    }
                    failures += 1;
                    if self.tuning.retries >= 0 && failures > self.tuning.retries {
                        warn!(
                            "Giving up on share for pool {} after {} retries",
                            pool.id, self.tuning.retries
                        );
                        self.stats.record_dropped(pool.id);
                        return;
                    }
                }
            }
            let pause = self.tuning.retry_pause.max(MIN_RESUBMIT_PAUSE);
            tokio::select! {
                _ = self.cancel_token().cancelled() => {
                    self.stats.record_dropped(pool.id);
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Account for a share verdict, whichever way it arrived.
    pub(crate) fn share_result(
        &self,
        pool: &Arc<Pool>,
        share: Option<&Job>,
        accepted: bool,
        reason: Option<&str>,
        difficulty: f64,
    ) {
        let worker = share.and_then(|s| s.worker);
        let stale = share.map_or(false, |s| self.is_stale(s, true));
        self.stats.record_share(pool.id, worker, accepted, difficulty);

        if accepted {
            debug!("Accepted share diff {:.3} on pool {}", difficulty, pool.id);
            pool.reset_seq_rejects();
            if self.pools.status(pool.id) == Some(PoolStatus::Rejecting) {
                info!("Pool {} accepting shares again, re-enabling", pool.id);
                if let Err(e) = self.pools.enable_pool(pool.id) {
                    warn!("Could not re-enable pool {}: {}", pool.id, e);
                }
            }
            if let Some(limit) = self.tuning.share_limit {
                if self.stats.accepted_total() >= limit {
                    info!("Reached share limit of {}", limit);
                    self.request_shutdown();
                }
            }
            return;
        }

        info!(
            "Rejected share on pool {}{}",
            pool.id,
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
        let run = pool.bump_seq_rejects();
        if !self.tuning.disable_rejecting_pools || stale || run <= REJECT_RUN {
            return;
        }
        if self.pools.enabled_count() <= 1 {
            return;
        }
        let minutes = self.stats.uptime().as_secs_f64() / 60.0;
        let utility = if minutes > 0.0 {
            self.stats.pool(pool.id).shares.accepted as f64 / minutes
        } else {
            0.0
        };
        if run as f64 > utility * 3.0 {
            self.pools.mark_rejecting(pool.id);
            pool.reset_seq_rejects();
        }
    }
}
