//! Memory-mapped statistics file engine.
//!
//! On-disk, a statfile is a fixed header, one or more named sections, and
//! a flat array of 16-byte `(hash1, hash2, value)` blocks per section,
//! addressed by a bounded open-addressing probe (see [`table`]). A
//! [`pool::Pool`] owns the set of currently mapped files and hands out
//! [`pool::HandleId`]s to callers; [`handle::Handle`] is the single
//! mapped file itself.
//!
//! The classifier, config loader, synchronizer, and scheduler this engine
//! is embedded in are represented by the narrow traits in [`collab`] so
//! the engine can be driven in tests without any of them.

pub mod collab;
pub mod error;
pub mod format;
pub mod handle;
pub mod pool;
pub mod table;

pub use collab::{
    ClassifierConfig, Clock, LegacyMigrator, PoolConfig, StatfileConfig, Synchronizer, SystemClock, Timer,
    TimerHandle,
};
pub use error::{Error, Result};
pub use handle::Handle;
pub use pool::{HandleId, Pool, STATFILES_MAX};
pub use table::PutOutcome;
