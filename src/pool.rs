//! Statfile pool: the registry of open statfiles, generalized from the
//! teacher's single-cache `shm::ShmCache` (`shm/mod.rs`) to many named
//! handles, matching `statfile_pool_t` in the original backend (a bounded
//! array of `statfile_pool_entry` keyed by path).
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::collab::{ClassifierConfig, Clock, LegacyMigrator, PoolConfig, Timer, TimerHandle};
use crate::error::{Error, Result};
use crate::format;
use crate::handle::Handle;
use crate::table::PutOutcome;

/// Hard cap on simultaneously open statfiles (spec §4.4, `STATFILES_MAX`
/// in the original backend).
pub const STATFILES_MAX: usize = 255;

/// Opaque reference to a handle held by a `Pool`. Stable for the handle's
/// lifetime; a closed slot's id is reused by a later `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(usize);

pub struct Pool {
    handles: RwLock<Vec<Option<Handle>>>,
    mlock_enabled: AtomicBool,
    pending_flush: Mutex<Option<TimerHandle>>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Pool {
            handles: RwLock::new(Vec::new()),
            mlock_enabled: AtomicBool::new(config.mlock_enabled),
            pending_flush: Mutex::new(None),
        }
    }

    /// Linear search by path, matching `statfile_pool_is_open` (spec §4.4).
    pub fn is_open(&self, path: &Path) -> Option<HandleId> {
        let handles = self.handles.read();
        handles
            .iter()
            .position(|slot| matches!(slot, Some(h) if h.path == path))
            .map(HandleId)
    }

    /// Open (or return the already-open) statfile at `path`. Mirrors
    /// `statfile_pool_open` plus the pool's capacity check.
    pub fn open(
        &self,
        path: &Path,
        size: u64,
        forced: bool,
        clock: &dyn Clock,
        migrator: &dyn LegacyMigrator,
    ) -> Result<HandleId> {
        if let Some(id) = self.is_open(path) {
            return Ok(id);
        }

        let mut handles = self.handles.write();
        if let Some(pos) = handles.iter().position(|slot| matches!(slot, Some(h) if h.path == path)) {
            return Ok(HandleId(pos));
        }

        let occupied = handles.iter().filter(|slot| slot.is_some()).count();
        if occupied >= STATFILES_MAX {
            return Err(Error::CapacityExceeded { max: STATFILES_MAX });
        }

        let mlock_enabled = self.mlock_enabled.load(Ordering::Relaxed);
        let handle = Handle::open(path, size, forced, mlock_enabled, clock, migrator)?;

        if let Some(pos) = handles.iter().position(|slot| slot.is_none()) {
            handles[pos] = Some(handle);
            Ok(HandleId(pos))
        } else {
            handles.push(Some(handle));
            Ok(HandleId(handles.len() - 1))
        }
    }

    pub fn close(&self, id: HandleId) -> Result<()> {
        let mut handles = self.handles.write();
        let slot = handles.get_mut(id.0).ok_or(Error::HandleNotFound { id: id.0 })?;
        let handle = slot.take().ok_or(Error::HandleNotFound { id: id.0 })?;
        handle.close();
        Ok(())
    }

    pub fn get(&self, id: HandleId, h1: u32, h2: u32, clock: &dyn Clock) -> Result<f64> {
        let handles = self.handles.read();
        let handle = handles
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::HandleNotFound { id: id.0 })?;
        Ok(handle.get(h1, h2, clock.now()))
    }

    pub fn put(&self, id: HandleId, h1: u32, h2: u32, value: f64, clock: &dyn Clock) -> Result<PutOutcome> {
        let handles = self.handles.read();
        let handle = handles
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::HandleNotFound { id: id.0 })?;
        Ok(handle.put(h1, h2, clock.now(), value, true))
    }

    /// Resolve a classifier symbol to its handle, opening (and optionally
    /// creating) the backing statfile on demand. Mirrors
    /// `get_statfile_by_symbol`.
    pub fn get_by_symbol(
        &self,
        classifier: &dyn ClassifierConfig,
        symbol: &str,
        try_create: bool,
        clock: &dyn Clock,
        migrator: &dyn LegacyMigrator,
    ) -> Result<HandleId> {
        let path = classifier
            .statfile_path(symbol)
            .ok_or_else(|| Error::SymbolNotConfigured { symbol: symbol.to_string() })?;

        if let Some(id) = self.is_open(&path) {
            return Ok(id);
        }

        let size = classifier.statfile_size(symbol).unwrap_or(0);

        match self.open(&path, size, false, clock, migrator) {
            Ok(id) => Ok(id),
            Err(_) if try_create => {
                if size == 0 {
                    return Err(Error::SymbolNotConfigured { symbol: symbol.to_string() });
                }
                format::create(&path, size, clock.now())?;
                self.open(&path, size, true, clock, migrator)
            }
            Err(e) => Err(e),
        }
    }

    /// `mlock` every currently open handle; disable pool-wide `mlock` on
    /// the first failure rather than retrying handle by handle, matching
    /// `statfile_pool_lockall`.
    pub fn lock_all(&self) {
        let mut handles = self.handles.write();
        for slot in handles.iter_mut().flatten() {
            if !slot.try_lock_pages() {
                self.mlock_enabled.store(false, Ordering::Relaxed);
                log::warn!(target: "statfile", "disabling pool-wide mlock after a failed lock attempt");
                break;
            }
        }
    }

    /// Schedule (or re-schedule) a periodic flush of every open handle.
    /// Cancels any previously pending timer so repeated calls don't pile
    /// up duplicate flush loops, matching `statfile_pool_plan_invalidate`'s
    /// re-arming behavior. Takes `Arc<Self>` because the scheduled
    /// callback re-arms itself once it fires.
    pub fn plan_invalidate(self: Arc<Self>, timer: Arc<dyn Timer>, seconds: u64, jitter: u64) {
        if let Some(prev) = self.pending_flush.lock().take() {
            timer.cancel(prev);
        }

        let delay = if jitter > 0 {
            seconds + rand::thread_rng().gen_range(0..jitter)
        } else {
            seconds
        };

        let pool = Arc::clone(&self);
        let timer_for_rearm = Arc::clone(&timer);
        let new_handle = timer.schedule_once(
            delay,
            Box::new(move || {
                pool.flush_all();
                Pool::plan_invalidate(Arc::clone(&pool), Arc::clone(&timer_for_rearm), seconds, jitter);
            }),
        );
        *self.pending_flush.lock() = Some(new_handle);
    }

    fn flush_all(&self) {
        let handles = self.handles.read();
        let mut count = 0usize;
        for handle in handles.iter().flatten() {
            handle.flush_async();
            count += 1;
        }
        log::debug!(target: "statfile", "periodic flush touched {count} open statfiles");
    }

    pub fn open_count(&self) -> usize {
        self.handles.read().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collab::{DefaultLegacyMigrator, SystemClock};
    use crate::format;

    fn tempdir() -> tempfile::TempDir {
        env_logger::try_init().ok();
        tempfile::tempdir().unwrap()
    }

    fn statfile(dir: &tempfile::TempDir, name: &str, size: u64) -> std::path::PathBuf {
        let path = dir.path().join(name);
        format::create(&path, size, 1_700_000_000).unwrap();
        path
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempdir();
        let path = statfile(&dir, "a.bin", 65536);
        let pool = Pool::new(PoolConfig::default());
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        let id1 = pool.open(&path, 65536, false, &clock, &migrator).unwrap();
        let id2 = pool.open(&path, 65536, false, &clock, &migrator).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn closed_slot_is_reused() {
        let dir = tempdir();
        let path_a = statfile(&dir, "a.bin", 65536);
        let path_b = statfile(&dir, "b.bin", 65536);
        let pool = Pool::new(PoolConfig::default());
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        let id_a = pool.open(&path_a, 65536, false, &clock, &migrator).unwrap();
        pool.close(id_a).unwrap();
        let id_b = pool.open(&path_b, 65536, false, &clock, &migrator).unwrap();
        assert_eq!(id_b.0, id_a.0);
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn get_put_round_trip_through_the_pool() {
        let dir = tempdir();
        let path = statfile(&dir, "a.bin", 65536);
        let pool = Pool::new(PoolConfig::default());
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        let id = pool.open(&path, 65536, false, &clock, &migrator).unwrap();
        pool.put(id, 10, 20, 3.5, &clock).unwrap();
        assert_eq!(pool.get(id, 10, 20, &clock).unwrap(), 3.5);
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempdir();
        let pool = Pool::new(PoolConfig::default());
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        for i in 0..STATFILES_MAX {
            let path = statfile(&dir, &format!("f{i}.bin"), 4096);
            pool.open(&path, 4096, false, &clock, &migrator).unwrap();
        }
        let overflow = statfile(&dir, "overflow.bin", 4096);
        let err = pool.open(&overflow, 4096, false, &clock, &migrator).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max } if max == STATFILES_MAX));
    }

    /// Fires scheduled callbacks synchronously when told to, instead of on
    /// a real clock, so `plan_invalidate`'s re-arming can be tested without
    /// sleeping.
    struct RecordingTimer {
        scheduled: Mutex<Vec<Box<dyn Fn() + Send>>>,
    }

    impl RecordingTimer {
        fn new() -> Self {
            RecordingTimer { scheduled: Mutex::new(Vec::new()) }
        }

        fn fire_all(&self) {
            let callbacks = std::mem::take(&mut *self.scheduled.lock());
            for cb in callbacks {
                cb();
            }
        }
    }

    impl Timer for RecordingTimer {
        fn schedule_once(&self, _delay_secs: u64, callback: Box<dyn Fn() + Send>) -> TimerHandle {
            let mut scheduled = self.scheduled.lock();
            scheduled.push(callback);
            TimerHandle((scheduled.len() - 1) as u64)
        }
        fn cancel(&self, _handle: TimerHandle) {}
    }

    #[test]
    fn plan_invalidate_rearms_exactly_once_per_fire() {
        let dir = tempdir();
        let path = statfile(&dir, "a.bin", 65536);
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;
        pool.open(&path, 65536, false, &clock, &migrator).unwrap();

        let recording = Arc::new(RecordingTimer::new());
        let timer: Arc<dyn Timer> = recording.clone();
        pool.plan_invalidate(timer, 30, 0);

        recording.fire_all();
        assert_eq!(recording.scheduled.lock().len(), 1, "exactly one flush rearmed itself");

        recording.fire_all();
        assert_eq!(recording.scheduled.lock().len(), 1, "repeated fires don't pile up duplicate timers");
    }
}
