//! Reference CPU backend: double SHA-256 over the 80-byte header.
//!
//! Each backend instance is one worker slot driving one OS thread. The
//! first 64 header bytes do not change while scanning nonces, so their
//! SHA-256 state is computed once per job and cloned for every nonce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use quarry_core::difficulty::hash_meets_target;
use quarry_core::{EngineError, Job, Result, WorkerBackend, WorkerHandle};

/// Nonces tried between checks for new work.
const BATCH: u32 = 0x4000;
const REPORT_EVERY: Duration = Duration::from_secs(1);

/// SHA-256 state after the constant first block of a header.
pub struct Midstate {
    state: Sha256,
    tail: [u8; 16],
}

impl Midstate {
    pub fn new(header: &[u8; 80]) -> Self {
        let mut state = Sha256::new();
        state.update(&header[..64]);
        let mut tail = [0u8; 16];
        tail.copy_from_slice(&header[64..80]);
        Self { state, tail }
    }

    /// Little-endian double SHA-256 of the header with `nonce` in place.
    pub fn hash(&mut self, nonce: u32) -> [u8; 32] {
        self.tail[12..16].copy_from_slice(&nonce.to_le_bytes());
        let mut first = self.state.clone();
        first.update(self.tail);
        Sha256::digest(first.finalize()).into()
    }
}

#[derive(Default)]
struct Flags {
    stop: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
}

pub struct CpuBackend {
    name: String,
    flags: Arc<Flags>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpuBackend {
    pub fn new(index: usize) -> Self {
        Self {
            name: format!("cpu{}", index),
            flags: Arc::new(Flags::default()),
            thread: Mutex::new(None),
        }
    }
}

impl WorkerBackend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, handle: WorkerHandle) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(EngineError::Config(format!("{} already started", self.name)));
        }
        self.flags.stop.store(false, Ordering::Release);
        self.flags.running.store(true, Ordering::Release);
        let flags = Arc::clone(&self.flags);
        let spawned = std::thread::Builder::new()
            .name(format!("quarry-{}", self.name))
            .spawn(move || {
                mining_loop(&handle, &flags);
                flags.running.store(false, Ordering::Release);
            });
        match spawned {
            Ok(joiner) => {
                *thread = Some(joiner);
                Ok(())
            }
            Err(e) => {
                self.flags.running.store(false, Ordering::Release);
                error!("Failed to spawn {} thread: {}", self.name, e);
                Err(EngineError::ResourceExhausted(e.to_string()))
            }
        }
    }

    fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.flags.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.flags.paused.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::Acquire)
    }
}

fn mining_loop(handle: &WorkerHandle, flags: &Flags) {
    debug!("CPU worker {} started", handle.id());
    while let Some(job) = handle.get_job() {
        if flags.stop.load(Ordering::Acquire) {
            break;
        }
        scan(handle, flags, &job);
    }
    debug!("CPU worker {} stopped", handle.id());
}

/// Nonces in the batch starting at `start`; the last batch ends on `u32::MAX`.
fn batch(start: u32) -> RangeInclusive<u32> {
    start..=start.saturating_add(BATCH - 1)
}

/// Work through the nonce space of one job until it runs out, goes stale
/// or the worker is told to stop or pause.
fn scan(handle: &WorkerHandle, flags: &Flags, job: &Job) {
    let epoch = handle.restart_epoch();
    let mut midstate = Midstate::new(&job.header);
    let mut nonce: u32 = 0;
    let mut hashes: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let range = batch(nonce);
        let last = *range.end();
        for n in range {
            if hash_meets_target(&midstate.hash(n), &job.target) {
                // re-verified by the engine; a mismatch counts as a hardware error
                handle.submit_nonce(job, n);
            }
        }
        hashes += u64::from(last - nonce) + 1;

        if last_report.elapsed() >= REPORT_EVERY {
            handle.report_hashrate_sample(hashes, last_report.elapsed());
            hashes = 0;
            last_report = Instant::now();
        }

        if last == u32::MAX
            || flags.stop.load(Ordering::Acquire)
            || flags.paused.load(Ordering::Acquire)
            || handle.should_stop()
            || handle.job_is_obsolete(job, epoch)
        {
            break;
        }
        nonce = last + 1;
    }
    if hashes > 0 {
        handle.report_hashrate_sample(hashes, last_report.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> [u8; 80] {
        let mut header = [0u8; 80];
        for (i, b) in header.iter_mut().enumerate() {
            *b = i as u8;
        }
        header
    }

    fn reference(header: &[u8; 80]) -> [u8; 32] {
        Sha256::digest(Sha256::digest(header)).into()
    }

    #[test]
    fn test_midstate_matches_full_hash() {
        let mut header = header();
        let mut midstate = Midstate::new(&header);
        for nonce in [0u32, 1, 0xdead_beef, u32::MAX] {
            header[76..80].copy_from_slice(&nonce.to_le_bytes());
            assert_eq!(midstate.hash(nonce), reference(&header));
        }
    }

    #[test]
    fn test_batches_cover_whole_nonce_space() {
        assert_eq!(batch(0), 0..=BATCH - 1);
        let mut start = 0u32;
        let mut batches = 0u64;
        loop {
            let range = batch(start);
            batches += 1;
            if *range.end() == u32::MAX {
                break;
            }
            start = range.end() + 1;
        }
        assert_eq!(batches, (1u64 << 32) / u64::from(BATCH));
        assert!(batch(u32::MAX - 3).contains(&u32::MAX));
    }

    #[test]
    fn test_backend_flags() {
        let backend = CpuBackend::new(3);
        assert_eq!(backend.name(), "cpu3");
        assert!(!backend.is_running());
        backend.pause();
        assert!(backend.flags.paused.load(Ordering::Acquire));
        backend.resume();
        assert!(!backend.flags.paused.load(Ordering::Acquire));
    }
}
