//! Deciding whether a job is still worth working on or submitting.

use std::time::Duration;

use crate::engine::EngineContext;
use crate::job::{Job, JobPayload, ProtocolKind, MAX_ROLLS};

/// Floor for the expiry window once fetch latency is subtracted.
const MIN_EXPIRY: Duration = Duration::from_secs(5);

impl EngineContext {
    /// `for_submission` relaxes the checks that only matter for handing
    /// work out: a pub/sub share may still be sent on a reconnecting
    /// session and a non-current pool may still take shares in fail-only
    /// mode. Benchmark shares are never stale.
    pub fn is_stale(&self, job: &Job, for_submission: bool) -> bool {
        if for_submission && job.protocol == ProtocolKind::Benchmark {
            return false;
        }
        if job.stale || job.generation != self.blocks.generation() {
            return true;
        }

        if let JobPayload::Stratum(work) = &job.payload {
            let session = job.pool.session();
            if work.session != session.epoch {
                return true;
            }
            if !session.active && !for_submission {
                return true;
            }
        }

        let expiry = match job.roll_time {
            Some(roll) if roll > self.tuning.scan_time => roll,
            _ => self.tuning.expiry,
        };
        let window = expiry
            .saturating_sub(job.pool.fetch_latency())
            .max(MIN_EXPIRY);
        if job.staged_at.elapsed() > window {
            return true;
        }

        if !for_submission
            && self.tuning.fail_only
            && !job.mandatory
            && !self.pools.is_current(job.pool.id)
            && !self.pools.strategy().is_shared()
        {
            return true;
        }
        false
    }

    /// Whether it is still early enough in the job's life to keep
    /// extending it rather than fetch fresh work.
    pub fn should_roll(&self, job: &Job) -> bool {
        if !self.pools.is_current(job.pool.id) && !self.pools.strategy().is_shared() {
            return false;
        }
        let window = job.roll_time.unwrap_or_default().max(self.tuning.scan_time);
        job.staged_at.elapsed() <= window * 2 / 3
    }

    pub fn can_roll(&self, job: &Job) -> bool {
        job.protocol != ProtocolKind::PubSub
            && job.roll_time.is_some()
            && !job.is_clone
            && job.roll_count < MAX_ROLLS
            && !self.is_stale(job, false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::{EngineConfig, Tuning};
    use crate::engine::EngineContext;
    use crate::job::StratumWork;
    use crate::pool::{PoolSet, Strategy};
    use crate::testing::{test_job, test_pool};

    fn context(pools: usize, fail_only: bool) -> EngineContext {
        let config = EngineConfig {
            fail_only,
            ..EngineConfig::default()
        };
        let tuning = Tuning::from_config(&config).unwrap();
        let entries = (0..pools).map(|i| (test_pool(i), 1, true)).collect();
        let set = PoolSet::new(entries, Strategy::Failover, fail_only).unwrap();
        EngineContext::new(tuning, set).unwrap()
    }

    fn staged(ctx: &EngineContext, pool: usize) -> Job {
        let mut job = test_job(&ctx.pools.get(pool).unwrap());
        ctx.blocks.observe(&mut job, true, false);
        job
    }

    fn aged(mut job: Job, by: Duration) -> Job {
        job.staged_at = Instant::now().checked_sub(by).unwrap();
        job
    }

    #[tokio::test]
    async fn test_fresh_job_is_not_stale() {
        let ctx = context(1, false);
        let job = staged(&ctx, 0);
        assert!(!ctx.is_stale(&job, false));
        assert!(!ctx.is_stale(&job, true));
    }

    #[tokio::test]
    async fn test_expiry_window() {
        let ctx = context(1, false);
        let job = aged(staged(&ctx, 0), Duration::from_secs(119));
        assert!(!ctx.is_stale(&job, false));
        let job = aged(staged(&ctx, 0), Duration::from_secs(121));
        assert!(ctx.is_stale(&job, false));

        // a long roll allowance stretches the window
        let job = aged(staged(&ctx, 0), Duration::from_secs(200)).with_roll_time(Some(Duration::from_secs(300)));
        assert!(!ctx.is_stale(&job, false));
    }

    #[tokio::test]
    async fn test_old_generation_is_stale() {
        let ctx = context(1, false);
        let job = staged(&ctx, 0);
        ctx.blocks.observe(&mut crate::testing::job_on(&ctx.pools.get(0).unwrap(), 0x33), true, false);
        assert!(ctx.is_stale(&job, false));
        assert!(ctx.is_stale(&job, true));
    }

    #[tokio::test]
    async fn test_fail_only_rejects_backup_work_but_not_submission() {
        let ctx = context(2, true);
        let job = staged(&ctx, 1);
        assert!(ctx.is_stale(&job, false));
        assert!(!ctx.is_stale(&job, true));

        let mut mandatory = staged(&ctx, 1);
        mandatory.mandatory = true;
        assert!(!ctx.is_stale(&mandatory, false));
    }

    #[tokio::test]
    async fn test_pubsub_session_rules() {
        let ctx = context(1, false);
        let pool = ctx.pools.get(0).unwrap();
        let epoch = pool.begin_session();
        let mut job = staged(&ctx, 0);
        job.protocol = ProtocolKind::PubSub;
        job.payload = JobPayload::Stratum(StratumWork {
            job_id: "1".into(),
            extranonce2: vec![0; 4],
            ntime: 0,
            session: epoch,
        });
        assert!(!ctx.is_stale(&job, false));

        pool.end_session();
        assert!(ctx.is_stale(&job, false));
        assert!(!ctx.is_stale(&job, true));

        pool.begin_session();
        assert!(ctx.is_stale(&job, true));
    }

    #[tokio::test]
    async fn test_benchmark_work_ages_but_shares_never_stale() {
        let ctx = context(1, false);
        let mut job = aged(staged(&ctx, 0), Duration::from_secs(130));
        job.protocol = ProtocolKind::Benchmark;
        assert!(ctx.is_stale(&job, false));
        assert!(!ctx.is_stale(&job, true));

        ctx.blocks.observe(&mut crate::testing::job_on(&ctx.pools.get(0).unwrap(), 0x33), true, false);
        assert!(ctx.is_stale(&job, false));
        assert!(!ctx.is_stale(&job, true));
    }

    #[tokio::test]
    async fn test_staleness_is_monotonic() {
        let ctx = context(1, false);
        let job = aged(staged(&ctx, 0), Duration::from_secs(130));
        assert!(ctx.is_stale(&job, false));
        for _ in 0..3 {
            ctx.blocks.observe(&mut staged(&ctx, 0), true, false);
            assert!(ctx.is_stale(&job, false));
        }
    }

    #[tokio::test]
    async fn test_roll_rules() {
        let ctx = context(1, false);
        let job = staged(&ctx, 0).with_roll_time(Some(Duration::from_secs(60)));
        assert!(ctx.can_roll(&job));
        assert!(ctx.should_roll(&job));

        let clone = job.make_clone();
        assert!(!ctx.can_roll(&clone));

        let late = aged(job.clone(), Duration::from_secs(41));
        assert!(!ctx.should_roll(&late));

        let fixed = staged(&ctx, 0);
        assert!(!ctx.can_roll(&fixed));

        let mut worn = job;
        worn.roll_count = MAX_ROLLS;
        assert!(!ctx.can_roll(&worn));
    }
}
