//! Narrow contracts for the engine's external collaborators (spec §6.2).
//!
//! The classifier, config loader, synchronizer, scheduler, and legacy
//! migrator all live outside this crate. Only the shapes they hand in or
//! expect back are defined here, so the engine can be exercised in tests
//! without any of them.
use std::path::PathBuf;

use crate::error::Result;

/// Per-statfile settings normally supplied by the config loader.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatfileConfig {
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub mlock_enabled: bool,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,
    #[serde(default = "default_flush_jitter_s")]
    pub flush_jitter_s: u64,
}

fn default_flush_interval_s() -> u64 {
    30
}
fn default_flush_jitter_s() -> u64 {
    30
}

/// Pool-wide settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct PoolConfig {
    #[serde(default)]
    pub mlock_enabled: bool,
}

/// Resolves a classifier symbol to the path of its backing statfile.
pub trait ClassifierConfig {
    fn statfile_path(&self, symbol: &str) -> Option<PathBuf>;
    fn statfile_size(&self, symbol: &str) -> Option<u64>;
}

/// Wall-clock time source, seconds since epoch (spec §6.2).
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// System clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Opaque handle to a scheduled one-shot timer, returned by `Timer::schedule_once`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// One-shot delayed callback scheduling, used only to drive periodic
/// flushes (spec §6.2). The engine owns exactly one such timer.
pub trait Timer: Send + Sync {
    fn schedule_once(&self, delay_secs: u64, callback: Box<dyn Fn() + Send>) -> TimerHandle;
    fn cancel(&self, handle: TimerHandle);
}

/// Reads and writes the revision/rev_time pair an external synchronizer
/// uses for cross-host replication (spec §6.2, Non-goals).
pub trait Synchronizer {
    fn set_revision(&self, revision: u64, rev_time: u64);
    fn inc_revision(&self) -> u64;
    fn get_revision(&self) -> (u64, u64);
}

/// Converts a legacy `{1,0}` header in place to the current `{'1','2'}`
/// format. Invoked only from `format::validate` (spec §4.1, §6.2).
pub trait LegacyMigrator {
    fn migrate_v1_0(&self, mmap: &mut [u8]) -> Result<()>;
}

/// Default migrator: bumps the version bytes and leaves every other field
/// untouched, since the legacy v1.0 layout is otherwise identical to v1.2
/// for the fields this engine reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLegacyMigrator;

impl LegacyMigrator for DefaultLegacyMigrator {
    fn migrate_v1_0(&self, mmap: &mut [u8]) -> Result<()> {
        crate::format::header::set_version(mmap, crate::format::VERSION);
        log::info!(target: "statfile", "upgraded legacy v1.0 header to v1.2 in place");
        Ok(())
    }
}
