//! Periodic health sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveTime};
use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;

use crate::config::Schedule;
use crate::engine::EngineContext;
use crate::pool::{Pool, Strategy};
use crate::worker::HealthAction;

/// Idle pools are re-probed every this many ticks.
const PROBE_EVERY: u64 = 10;
const REAP_IDLE: Duration = Duration::from_secs(300);
const BALANCE_DECAY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleAction {
    Run,
    Pause,
    Shutdown,
}

fn in_window(start: NaiveTime, stop: NaiveTime, now: NaiveTime) -> bool {
    if start <= stop {
        now >= start && now < stop
    } else {
        now >= start || now < stop
    }
}

/// `started` is whether a start-only schedule has already begun mining.
pub(crate) fn schedule_action(schedule: &Schedule, now: NaiveTime, started: bool) -> ScheduleAction {
    match (schedule.start, schedule.stop) {
        (Some(start), Some(stop)) if in_window(start, stop, now) => ScheduleAction::Run,
        (Some(_), Some(_)) => ScheduleAction::Pause,
        (Some(start), None) if started || now >= start => ScheduleAction::Run,
        (Some(_), None) => ScheduleAction::Pause,
        (None, Some(stop)) if now >= stop => ScheduleAction::Shutdown,
        _ => ScheduleAction::Run,
    }
}

fn log_summary(ctx: &EngineContext, rate: f64) {
    let global = ctx.stats.global();
    info!(
        "{}: A:{} R:{} S:{} HW:{} | {:.2} shares/min | queue {} | block {}",
        format_hashrate(rate),
        global.shares.accepted,
        global.shares.rejected,
        global.shares.stale,
        global.hw_errors,
        ctx.stats.utility(),
        ctx.queue.len(),
        ctx.blocks.generation(),
    );
}

/// Human readable hash rate.
pub fn format_hashrate(rate: f64) -> String {
    const UNITS: [&str; 7] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
    let mut value = rate.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

fn check_workers(ctx: &EngineContext) {
    let now = Instant::now();
    for slot in ctx.workers.slots() {
        if slot.is_paused() || slot.stop_requested() {
            continue;
        }
        if slot.check(now) == HealthAction::Restart {
            info!("Attempting to restart worker {}", slot.id);
            if let Err(e) = slot.backend().restart() {
                warn!("Restart of worker {} failed: {}", slot.id, e);
            }
        }
    }
}

async fn probe_idle(ctx: Arc<EngineContext>, pool: Arc<Pool>) {
    let timeout = ctx.tuning.request_timeout;
    let client = Arc::clone(pool.client());
    let probe = async {
        if client.supports_push() {
            client.probe(&pool).await.map(|_| None)
        } else {
            client.fetch_job(&pool).await.map(Some)
        }
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(job)) => {
            pool.reset_getfails();
            ctx.pools.mark_recovered(pool.id);
            if let Some(job) = job {
                ctx.stats.record_getwork(pool.id);
                ctx.stage_job(job);
            }
        }
        Ok(Err(e)) => debug!("Pool {} still down: {}", pool.id, e),
        Err(_) => debug!("Pool {} probe timed out", pool.id),
    }
    pool.end_probe();
}

fn probe_idle_pools(ctx: &Arc<EngineContext>) {
    let mut pools = ctx.pools.pools();
    pools.extend(ctx.pools.donation_pool());
    for pool in pools {
        if pool.is_idle() && pool.begin_probe() {
            debug!("Probing idle pool {}", pool.id);
            ctx.runtime().spawn(probe_idle(Arc::clone(ctx), pool));
        }
    }
}

fn reap_connections(ctx: &EngineContext) {
    let reaped: usize = ctx
        .pools
        .pools()
        .iter()
        .map(|pool| pool.client().reap_idle(REAP_IDLE))
        .sum();
    if reaped > 0 {
        debug!("Reaped {} idle connections", reaped);
    }
}

fn apply_schedule(ctx: &EngineContext, action: ScheduleAction) {
    match action {
        ScheduleAction::Run => {
            if ctx.workers.resume_all() {
                info!("Scheduled mining window open, resuming workers");
            }
        }
        ScheduleAction::Pause => {
            if ctx.workers.pause_all() {
                info!("Outside scheduled mining window, pausing workers");
            }
        }
        ScheduleAction::Shutdown => {
            info!("Scheduled stop time reached");
            ctx.request_shutdown();
        }
    }
}

pub(crate) async fn run(ctx: Arc<EngineContext>) {
    let cancel = ctx.cancel_token().clone();
    let mut ticker = tokio::time::interval(ctx.tuning.watchdog_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks: u64 = 0;
    let mut last_meter = Instant::now();
    let mut last_rotate = Instant::now();
    let mut last_decay = Instant::now();
    let mut schedule_started = false;
    debug!("Watchdog started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        ticks += 1;

        ctx.discard_stale();

        if last_meter.elapsed() >= ctx.tuning.log_interval {
            let rate = ctx.stats.decay_meter(ctx.tuning.log_interval);
            log_summary(&ctx, rate);
            last_meter = Instant::now();
        }

        check_workers(&ctx);

        if let Some(schedule) = &ctx.tuning.schedule {
            let action = schedule_action(schedule, Local::now().time(), schedule_started);
            schedule_started |= action == ScheduleAction::Run;
            apply_schedule(&ctx, action);
            if action == ScheduleAction::Shutdown {
                break;
            }
        }

        if ticks % PROBE_EVERY == 0 {
            probe_idle_pools(&ctx);
            reap_connections(&ctx);
        }

        match ctx.pools.strategy() {
            Strategy::Rotate if last_rotate.elapsed() >= ctx.tuning.rotate_period => {
                info!("Rotating pools");
                ctx.pools.switch_pools(None);
                ctx.discard_stale();
                last_rotate = Instant::now();
            }
            Strategy::Rotate => {}
            _ => last_rotate = Instant::now(),
        }

        if last_decay.elapsed() >= BALANCE_DECAY {
            if ctx.pools.strategy() == Strategy::Balance {
                ctx.pools.decay_shares();
            }
            last_decay = Instant::now();
        }
    }
    debug!("Watchdog stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::{EngineConfig, Tuning};
    use crate::job::ProtocolKind;
    use crate::pool::PoolSet;
    use crate::testing::{test_pool_with, MockClient};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule(start: Option<NaiveTime>, stop: Option<NaiveTime>) -> Schedule {
        Schedule { start, stop }
    }

    #[test]
    fn test_daytime_window() {
        let s = schedule(Some(t(8, 0)), Some(t(22, 0)));
        assert_eq!(schedule_action(&s, t(7, 59), false), ScheduleAction::Pause);
        assert_eq!(schedule_action(&s, t(8, 0), false), ScheduleAction::Run);
        assert_eq!(schedule_action(&s, t(22, 0), true), ScheduleAction::Pause);
    }

    #[test]
    fn test_window_across_midnight() {
        let s = schedule(Some(t(22, 0)), Some(t(6, 0)));
        assert_eq!(schedule_action(&s, t(23, 30), false), ScheduleAction::Run);
        assert_eq!(schedule_action(&s, t(3, 0), false), ScheduleAction::Run);
        assert_eq!(schedule_action(&s, t(12, 0), false), ScheduleAction::Pause);
    }

    #[test]
    fn test_stop_without_resume_shuts_down() {
        let s = schedule(None, Some(t(18, 0)));
        assert_eq!(schedule_action(&s, t(17, 0), false), ScheduleAction::Run);
        assert_eq!(schedule_action(&s, t(18, 5), false), ScheduleAction::Shutdown);
    }

    #[test]
    fn test_start_only_keeps_running_once_started() {
        let s = schedule(Some(t(9, 0)), None);
        assert_eq!(schedule_action(&s, t(8, 0), false), ScheduleAction::Pause);
        assert_eq!(schedule_action(&s, t(1, 0), true), ScheduleAction::Run);
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_recovered_primary_takes_over_again() {
        let primary = Arc::new(MockClient::new(ProtocolKind::Poll));
        let backup = Arc::new(MockClient::new(ProtocolKind::Poll));
        let entries = vec![
            (test_pool_with(0, primary.clone()), 1, true),
            (test_pool_with(1, backup), 1, true),
        ];
        let tuning = Tuning::from_config(&EngineConfig::default()).unwrap();
        let set = PoolSet::new(entries, Strategy::Failover, false).unwrap();
        let ctx = Arc::new(EngineContext::new(tuning, set).unwrap());
        let pool = ctx.pools.get(0).unwrap();

        primary.fail.store(true, Ordering::SeqCst);
        assert!(ctx.pools.mark_dead(0));
        assert_eq!(ctx.pools.current_id(), 1);

        // still down: the probe leaves it idle
        probe_idle_pools(&ctx);
        wait_until(|| primary.fetches.load(Ordering::SeqCst) == 1).await;
        tokio::task::yield_now().await;
        assert!(pool.is_idle());
        assert_eq!(ctx.pools.current_id(), 1);

        primary.fail.store(false, Ordering::SeqCst);
        probe_idle_pools(&ctx);
        wait_until(|| !pool.is_idle()).await;

        assert!(!pool.is_idle());
        assert_eq!(ctx.pools.current_id(), 0);
        assert_eq!(ctx.stats.pool(0).getworks, 1);
        assert_eq!(ctx.queue.len(), 1);
    }

    #[test]
    fn test_format_hashrate() {
        assert_eq!(format_hashrate(950.0), "950.00 H/s");
        assert_eq!(format_hashrate(12_500_000.0), "12.50 MH/s");
        assert_eq!(format_hashrate(-3.0), "0.00 H/s");
    }
}
