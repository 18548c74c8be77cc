//! The boundary with compute backends.
//!
//! Backends run their own threads and talk to the engine only through a
//! [`WorkerHandle`]: they pull jobs, hand back nonces and report liveness.
//! The engine drives them through [`WorkerBackend`] and the watchdog
//! classifies their health from the liveness reports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::job::Job;

/// No liveness report for this long marks a worker sick.
pub const SICK_AFTER: Duration = Duration::from_secs(60);
/// ...and this long marks it dead.
pub const DEAD_AFTER: Duration = Duration::from_secs(600);
/// Minimum spacing between restart attempts for one worker.
pub const RESTART_SPACING: Duration = Duration::from_secs(60);

/// How long a blocked [`WorkerHandle::get_job`] waits between checks.
const POP_SLICE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Well,
    Sick,
    Dead,
}

/// Backend-specific knobs passed through from configuration.
#[derive(Debug, Clone, Default)]
pub struct DeviceParams {
    pub index: usize,
    pub options: BTreeMap<String, String>,
}

pub trait WorkerBackend: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, _params: &DeviceParams) -> Result<()> {
        Ok(())
    }

    /// Begin mining. Must return promptly; the backend owns its threads.
    fn start(&self, handle: WorkerHandle) -> Result<()>;

    fn request_stop(&self);

    fn pause(&self) {}

    fn resume(&self) {}

    /// Best-effort recovery of a hung device.
    fn restart(&self) -> Result<()> {
        Err(EngineError::Hardware {
            worker: 0,
            reason: format!("{} cannot restart", self.name()),
        })
    }

    /// A busy backend is slow, not hung; the watchdog leaves it alone.
    fn is_busy(&self) -> bool {
        false
    }

    /// Nonces the backend gets through on one job before asking for more.
    fn nonce_scan_limit(&self) -> u64 {
        u32::MAX as u64 + 1
    }

    fn is_running(&self) -> bool;
}

struct SlotState {
    health: Health,
    last_alive: Instant,
    last_restart: Option<Instant>,
}

pub struct WorkerSlot {
    pub id: usize,
    backend: Arc<dyn WorkerBackend>,
    params: DeviceParams,
    state: Mutex<SlotState>,
    paused: AtomicBool,
    stop: AtomicBool,
}

/// What the watchdog should do about a worker after classifying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Restart,
}

/// Pure classification step used by the watchdog.
pub fn classify(silent_for: Duration) -> Health {
    if silent_for >= DEAD_AFTER {
        Health::Dead
    } else if silent_for >= SICK_AFTER {
        Health::Sick
    } else {
        Health::Well
    }
}

impl WorkerSlot {
    pub fn backend(&self) -> &Arc<dyn WorkerBackend> {
        &self.backend
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn mark_alive(&self) {
        let mut state = self.state.lock();
        state.last_alive = Instant::now();
        if state.health != Health::Well {
            info!("Worker {} recovered", self.id);
            state.health = Health::Well;
        }
    }

    /// Reclassify from the time since the last report and decide whether to
    /// attempt a restart.
    pub fn check(&self, now: Instant) -> HealthAction {
        let busy = self.backend.is_busy();
        let mut state = self.state.lock();
        let next = classify(now.saturating_duration_since(state.last_alive));
        let prev = state.health;
        state.health = next;
        if next == Health::Well || busy {
            return HealthAction::None;
        }
        if next != prev {
            warn!("Worker {} ({}) is {:?}", self.id, self.backend.name(), next);
        }
        let due = state
            .last_restart
            .map_or(true, |at| now.saturating_duration_since(at) >= RESTART_SPACING);
        if due {
            state.last_restart = Some(now);
            HealthAction::Restart
        } else {
            HealthAction::None
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_alive(&self, by: Duration) {
        let mut state = self.state.lock();
        state.last_alive = Instant::now().checked_sub(by).unwrap_or(state.last_alive);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub name: String,
    pub health: Health,
    pub paused: bool,
    pub running: bool,
    pub silent_secs: u64,
}

#[derive(Default)]
pub struct WorkerRegistry {
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: Arc<dyn WorkerBackend>, params: DeviceParams) -> usize {
        let mut slots = self.slots.write();
        let id = slots.len();
        slots.push(Arc::new(WorkerSlot {
            id,
            backend,
            params: DeviceParams { index: id, ..params },
            state: Mutex::new(SlotState {
                health: Health::Well,
                last_alive: Instant::now(),
                last_restart: None,
            }),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }));
        id
    }

    pub fn slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.slots.read().clone()
    }

    pub fn get(&self, id: usize) -> Option<Arc<WorkerSlot>> {
        self.slots.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if anything changed.
    pub fn pause_all(&self) -> bool {
        let mut changed = false;
        for slot in self.slots() {
            if !slot.paused.swap(true, Ordering::AcqRel) {
                slot.backend.pause();
                changed = true;
            }
        }
        changed
    }

    pub fn resume_all(&self) -> bool {
        let mut changed = false;
        for slot in self.slots() {
            if slot.paused.swap(false, Ordering::AcqRel) {
                slot.backend.resume();
                changed = true;
            }
        }
        changed
    }

    pub fn stop_all(&self) {
        for slot in self.slots() {
            slot.stop.store(true, Ordering::Release);
            slot.backend.request_stop();
        }
    }

    pub fn any_running(&self) -> bool {
        self.slots().iter().any(|s| s.backend.is_running())
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        self.slots()
            .iter()
            .map(|slot| {
                let state = slot.state.lock();
                WorkerSnapshot {
                    id: slot.id,
                    name: slot.backend.name().to_string(),
                    health: state.health,
                    paused: slot.is_paused(),
                    running: slot.backend.is_running(),
                    silent_secs: now.saturating_duration_since(state.last_alive).as_secs(),
                }
            })
            .collect()
    }
}

/// A backend's view of the engine.
#[derive(Clone)]
pub struct WorkerHandle {
    ctx: Arc<EngineContext>,
    slot: Arc<WorkerSlot>,
}

impl WorkerHandle {
    pub(crate) fn new(ctx: Arc<EngineContext>, slot: Arc<WorkerSlot>) -> Self {
        Self { ctx, slot }
    }

    pub fn id(&self) -> usize {
        self.slot.id
    }

    /// Block until a job is available. None once the worker should stop.
    pub fn get_job(&self) -> Option<Job> {
        loop {
            if self.should_stop() {
                return None;
            }
            self.report_alive();
            if self.is_paused() {
                std::thread::sleep(POP_SLICE);
                continue;
            }
            let Some(mut job) = self.ctx.queue.pop(POP_SLICE) else {
                continue;
            };
            if self.ctx.is_stale(&job, false) {
                self.ctx.stats.record_discarded_work(job.pool.id, 1);
                continue;
            }
            // keep an extendable master in circulation and mine a copy
            if self.ctx.can_roll(&job) && self.ctx.should_roll(&job) {
                job.roll();
                let clone = job.make_clone();
                job.roll();
                self.ctx.queue.stage(job);
                job = clone;
            }
            job.worker = Some(self.slot.id);
            return Some(job);
        }
    }

    /// Hand back a nonce found on `job`. False if it does not meet the
    /// job's target (counted as a hardware error).
    pub fn submit_nonce(&self, job: &Job, nonce: u32) -> bool {
        self.ctx.submit_nonce(job, nonce, Some(self.slot.id))
    }

    pub fn report_hashrate_sample(&self, hashes: u64, _elapsed: Duration) {
        self.ctx.stats.record_hashes(self.slot.id, hashes);
        self.slot.mark_alive();
    }

    pub fn report_alive(&self) {
        self.slot.mark_alive();
    }

    pub fn report_hardware_error(&self, reason: &str) {
        warn!("Worker {} hardware error: {}", self.slot.id, reason);
        self.ctx.stats.record_hw_error(Some(self.slot.id));
    }

    pub fn should_stop(&self) -> bool {
        self.slot.stop_requested() || self.ctx.is_shutting_down()
    }

    pub fn is_paused(&self) -> bool {
        self.slot.is_paused()
    }

    /// Bumped whenever in-flight work becomes worthless.
    pub fn restart_epoch(&self) -> u64 {
        self.ctx.restart_epoch()
    }

    /// Whether `job` should be abandoned in favour of fresh work.
    pub fn job_is_obsolete(&self, job: &Job, epoch: u64) -> bool {
        epoch != self.ctx.restart_epoch() || self.ctx.is_stale(job, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct IdleBackend {
        pub busy: AtomicBool,
        pub restarts: AtomicUsize,
        pub paused: AtomicBool,
    }

    impl WorkerBackend for IdleBackend {
        fn name(&self) -> &str {
            "idle"
        }

        fn start(&self, _handle: WorkerHandle) -> Result<()> {
            Ok(())
        }

        fn request_stop(&self) {}

        fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
        }

        fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn is_running(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(Duration::from_secs(59)), Health::Well);
        assert_eq!(classify(Duration::from_secs(60)), Health::Sick);
        assert_eq!(classify(Duration::from_secs(600)), Health::Dead);
    }

    #[test]
    fn test_sick_worker_restarted_once_per_minute() {
        let registry = WorkerRegistry::new();
        let id = registry.add(Arc::new(IdleBackend::default()), DeviceParams::default());
        let slot = registry.get(id).unwrap();
        slot.backdate_alive(Duration::from_secs(61));

        let now = Instant::now();
        assert_eq!(slot.check(now), HealthAction::Restart);
        assert_eq!(slot.health(), Health::Sick);
        assert_eq!(slot.check(now + Duration::from_secs(2)), HealthAction::None);
        assert_eq!(slot.check(now + Duration::from_secs(61)), HealthAction::Restart);
    }

    #[test]
    fn test_busy_worker_left_alone() {
        let backend = Arc::new(IdleBackend::default());
        backend.busy.store(true, Ordering::SeqCst);
        let registry = WorkerRegistry::new();
        let id = registry.add(backend, DeviceParams::default());
        let slot = registry.get(id).unwrap();
        slot.backdate_alive(Duration::from_secs(700));
        assert_eq!(slot.check(Instant::now()), HealthAction::None);
        assert_eq!(slot.health(), Health::Dead);
    }

    #[test]
    fn test_pause_and_resume_all() {
        let backend = Arc::new(IdleBackend::default());
        let registry = WorkerRegistry::new();
        registry.add(backend.clone(), DeviceParams::default());
        assert!(registry.pause_all());
        assert!(!registry.pause_all());
        assert!(backend.paused.load(Ordering::SeqCst));
        assert!(registry.snapshot()[0].paused);
        assert!(registry.resume_all());
        assert!(!backend.paused.load(Ordering::SeqCst));
    }
}
