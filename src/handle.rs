//! A single open, memory-mapped statfile.
//!
//! Owns the mapping, the advisory-lockable file descriptor, and the
//! current section cursor. Grounded on the teacher's `shm/region.rs`
//! (mmap lifecycle: create-or-open, header validation, `unlink`) and
//! `shm/mod.rs` (raw pointer accessors reached through `&self`, since
//! block-table mutation is not supposed to require exclusive access —
//! spec §5 explicitly allows benign cross-process races on the block
//! array). The per-file mutex here only guards operations that remap
//! (`append_section`, `reindex`), matching spec §5's "inter-process
//! synchronization" model rather than the teacher's `pthread_rwlock`,
//! since this engine's cross-process contract is advisory, not strict.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::collab::{Clock, LegacyMigrator, Synchronizer};
use crate::error::{Error, Result};
use crate::format::{self, header, section, BLOCK_SIZE, HEADER_SIZE, SECTION_HEADER_SIZE};
use crate::table::{self, PutOutcome};

/// `|requested_size - size_on_disk|` beyond this threshold triggers a
/// reindex rather than a plain open (spec §4.3 step 3).
const REINDEX_DRIFT_THRESHOLD: u64 = 2 * HEADER_SIZE as u64;

pub struct Handle {
    pub path: PathBuf,
    file: File,
    mmap: MmapMut,
    section_code: u64,
    /// Byte offset of this section's block `[0]` within the mapping.
    section_seek_pos: usize,
    /// Section length in blocks.
    section_length: u64,
    pub open_time: u64,
    access_time: AtomicU64,
    /// Guards remapping operations (`append_section`, the swap performed
    /// by `reindex`). Block-table `get`/`put` never take this lock.
    remap_mutex: Mutex<()>,
    mlocked: bool,
}

impl Handle {
    /// Open (or reindex-then-open) the statfile at `path`. Mirrors
    /// `statfile_pool_open` (spec §4.3).
    pub fn open(
        path: &Path,
        requested_size: u64,
        forced: bool,
        mlock_enabled: bool,
        clock: &dyn Clock,
        migrator: &dyn LegacyMigrator,
    ) -> Result<Handle> {
        let meta = std::fs::metadata(path).map_err(|e| Error::io("stat", path, e))?;
        let size_on_disk = meta.len();

        if !forced
            && requested_size > HEADER_SIZE as u64
            && size_on_disk.abs_diff(requested_size) > REINDEX_DRIFT_THRESHOLD
        {
            log::warn!(
                target: "statfile",
                "need to reindex statfile {}: old size {}, new size {}",
                path.display(),
                size_on_disk,
                requested_size,
            );
            return Self::reindex(path, size_on_disk, requested_size, mlock_enabled, clock, migrator);
        }

        Self::open_existing(path, mlock_enabled, clock, migrator)
    }

    fn open_existing(
        path: &Path,
        mlock_enabled: bool,
        clock: &dyn Clock,
        migrator: &dyn LegacyMigrator,
    ) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("open", path, e))?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::io("mmap", path, e))?;

        file.lock_exclusive().map_err(|e| Error::io("flock", path, e))?;
        let validate_result = format::validate(&mut mmap[..], path, |bytes| migrator.migrate_v1_0(bytes));
        let unlock_result = file.unlock();
        validate_result?;
        unlock_result.map_err(|e| Error::io("funlock", path, e))?;

        let section_seek_pos = HEADER_SIZE + SECTION_HEADER_SIZE;
        let section_header = &mmap[HEADER_SIZE..section_seek_pos];
        let section_code = section::code(section_header);
        let section_length = section::length(section_header);

        let mut mlocked = false;
        if mlock_enabled {
            mlocked = try_mlock(&mmap, path);
        }

        let now = clock.now();
        let handle = Handle {
            path: path.to_path_buf(),
            file,
            mmap,
            section_code,
            section_seek_pos,
            section_length,
            open_time: now,
            access_time: AtomicU64::new(now),
            remap_mutex: Mutex::new(()),
            mlocked,
        };
        handle.preload();
        log::debug!(target: "statfile", "opened statfile {} ({} blocks)", path.display(), section_length);
        Ok(handle)
    }

    /// Resize-in-place: rename the original aside, create a fresh file of
    /// `new_size`, copy every live block across via `table::put`, carry
    /// the revision forward, and unlink the backup (spec §4.3, §3.4).
    fn reindex(
        path: &Path,
        old_size: u64,
        new_size: u64,
        mlock_enabled: bool,
        clock: &dyn Clock,
        migrator: &dyn LegacyMigrator,
    ) -> Result<Handle> {
        let backup = backup_path(path);
        std::fs::rename(path, &backup).map_err(|e| Error::io("rename", path, e))?;

        if let Err(e) = format::create(path, new_size, clock.now()) {
            return Err(Error::ReindexFailed { path: path.to_path_buf(), reason: e.to_string() });
        }

        let mut new_handle = match Self::open_existing(path, mlock_enabled, clock, migrator) {
            Ok(h) => h,
            Err(e) => {
                return Err(Error::ReindexFailed { path: path.to_path_buf(), reason: e.to_string() })
            }
        };

        let old_file = OpenOptions::new()
            .read(true)
            .open(&backup)
            .map_err(|e| Error::io("open", backup.as_path(), e))?;
        let old_mmap = unsafe { memmap2::Mmap::map(&old_file) }
            .map_err(|e| Error::io("mmap", backup.as_path(), e))?;

        let old_section_start = HEADER_SIZE + SECTION_HEADER_SIZE;
        let old_section_len =
            section::length(&old_mmap[HEADER_SIZE..old_section_start]).min(
                ((old_size as usize).saturating_sub(old_section_start) / BLOCK_SIZE) as u64,
            );
        let old_blocks = &old_mmap[old_section_start..old_section_start + old_section_len as usize * BLOCK_SIZE];

        let mut copied = 0u64;
        for idx in 0..old_section_len {
            let h1 = format::block::hash1(old_blocks, idx);
            let h2 = format::block::hash2(old_blocks, idx);
            let value = format::block::value(old_blocks, idx);
            if h1 == 0 || value == 0.0 {
                continue;
            }
            new_handle.put(h1, h2, 0, value, false);
            copied += 1;
        }

        let old_revision = header::revision(&old_mmap);
        let old_rev_time = header::rev_time(&old_mmap);
        new_handle.set_revision(old_revision, old_rev_time);

        drop(old_mmap);
        drop(old_file);
        std::fs::remove_file(&backup).map_err(|e| Error::io("unlink", backup.as_path(), e))?;

        log::info!(
            target: "statfile",
            "reindexed {} into {} bytes, copied {} blocks",
            path.display(),
            new_size,
            copied,
        );
        Ok(new_handle)
    }

    fn preload(&self) {
        #[cfg(unix)]
        {
            let ptr = self.mmap.as_ptr() as *mut libc::c_void;
            let len = self.mmap.len();
            let advised = unsafe { libc::madvise(ptr, len, libc::MADV_SEQUENTIAL) };
            if advised != 0 {
                log::info!(target: "statfile", "madvise failed for {}: {}", self.path.display(), std::io::Error::last_os_error());
            }
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
            let bytes = self.bytes();
            let mut pos = 0usize;
            let mut touched: u64 = 0;
            while pos < bytes.len() {
                touched = touched.wrapping_add(bytes[pos] as u64);
                pos += page_size;
            }
            std::hint::black_box(touched);
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// # Safety
    /// Aliases a `&mut [u8]` view from `&self`. Sound only because the
    /// engine's contract (spec §5) already treats this memory as shared
    /// mutable state across threads and processes; torn 16-byte writes
    /// are an accepted cost, not a bug.
    fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_ptr() as *mut u8, self.mmap.len()) }
    }

    fn section_blocks(&self) -> &[u8] {
        let end = self.section_seek_pos + self.section_length as usize * BLOCK_SIZE;
        &self.bytes()[self.section_seek_pos..end]
    }

    fn section_blocks_mut(&self) -> &mut [u8] {
        let start = self.section_seek_pos;
        let end = start + self.section_length as usize * BLOCK_SIZE;
        &mut self.bytes_mut()[start..end]
    }

    pub fn get(&self, h1: u32, h2: u32, now: u64) -> f64 {
        self.access_time.store(now, Ordering::Relaxed);
        table::get(self.section_blocks(), self.section_length, h1, h2)
    }

    pub fn put(&self, h1: u32, h2: u32, t: u64, value: f64, touch_access: bool) -> PutOutcome {
        if touch_access {
            self.access_time.store(t, Ordering::Relaxed);
        }
        let outcome = table::put(self.section_blocks_mut(), self.section_length, h1, h2, value);
        if matches!(outcome, PutOutcome::Inserted) {
            header::incr_used_blocks(self.bytes_mut());
        }
        outcome
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub fn used_blocks(&self) -> u64 {
        header::used_blocks(self.bytes())
    }

    pub fn total_blocks(&self) -> u64 {
        let v = header::total_blocks(self.bytes());
        if v == 0 {
            self.section_length
        } else {
            v
        }
    }

    pub fn set_revision(&self, revision: u64, rev_time: u64) {
        let bytes = self.bytes_mut();
        header::set_revision(bytes, revision);
        header::set_rev_time(bytes, rev_time);
    }

    pub fn inc_revision(&self) -> u64 {
        let bytes = self.bytes_mut();
        let v = header::revision(bytes) + 1;
        header::set_revision(bytes, v);
        v
    }

    pub fn revision(&self) -> (u64, u64) {
        let bytes = self.bytes();
        (header::revision(bytes), header::rev_time(bytes))
    }

    pub fn section_code(&self) -> u64 {
        self.section_code
    }

    /// Move the cursor to section `code`, searching either from the
    /// start of the file or forward from the current cursor (spec §4.1).
    pub fn set_section(&mut self, code: u64, from_beginning: bool) -> Result<()> {
        match format::locate_section(self.bytes(), code, from_beginning, self.section_seek_pos) {
            Some((seek_pos, length)) => {
                self.section_code = code;
                self.section_seek_pos = seek_pos;
                self.section_length = length;
                Ok(())
            }
            None => Err(Error::SectionNotFound { code }),
        }
    }

    /// Append a new section at the end of the file and remap. Caller
    /// (the pool) is expected to hold this handle exclusively; the
    /// remap mutex additionally excludes a concurrent `reindex`.
    pub fn append_section(&mut self, code: u64, length: u64) -> Result<()> {
        let _guard = self.remap_mutex.lock();

        let end = self.mmap.len() as u64;
        let mut sect_buf = [0u8; SECTION_HEADER_SIZE];
        section::set_code(&mut sect_buf, code);
        section::set_length(&mut sect_buf, length);

        write_at(&self.file, &self.path, end, &sect_buf)?;
        let zero_blocks = vec![0u8; length as usize * BLOCK_SIZE];
        write_at(&self.file, &self.path, end + SECTION_HEADER_SIZE as u64, &zero_blocks)?;

        self.file.sync_data().map_err(|e| Error::io("fsync", self.path.as_path(), e))?;
        let new_len = end + SECTION_HEADER_SIZE as u64 + length * BLOCK_SIZE as u64;

        let old_mlocked = self.mlocked;
        // Drop the old mapping before remapping to the grown file.
        self.mmap = unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| Error::io("mmap", self.path.as_path(), e))?;
        if old_mlocked {
            self.mlocked = try_mlock(&self.mmap, &self.path);
        }

        debug_assert_eq!(self.mmap.len() as u64, new_len);
        self.section_code = code;
        self.section_seek_pos = end as usize + SECTION_HEADER_SIZE;
        self.section_length = length;
        Ok(())
    }

    /// Flush with `MS_ASYNC` (best-effort, spec §5 Non-goals).
    pub fn flush_async(&self) {
        if let Err(e) = self.mmap.flush_async() {
            log::warn!(target: "statfile", "msync(MS_ASYNC) failed for {}: {e}", self.path.display());
        }
    }

    /// Close: flush async and unmap (drop does the unmap).
    pub fn close(self) {
        self.flush_async();
        log::info!(target: "statfile", "closed statfile {}", self.path.display());
    }

    pub fn is_mlocked(&self) -> bool {
        self.mlocked
    }

    pub fn try_lock_pages(&mut self) -> bool {
        self.mlocked = try_mlock(&self.mmap, &self.path);
        self.mlocked
    }
}

#[cfg(unix)]
fn try_mlock(mmap: &MmapMut, path: &Path) -> bool {
    let ret = unsafe { libc::mlock(mmap.as_ptr() as *const libc::c_void, mmap.len()) };
    if ret != 0 {
        log::warn!(
            target: "statfile",
            "mlock of statfile {} failed, maybe RLIMIT_MEMLOCK is too low: {}",
            path.display(),
            std::io::Error::last_os_error(),
        );
        false
    } else {
        true
    }
}

#[cfg(not(unix))]
fn try_mlock(_mmap: &MmapMut, _path: &Path) -> bool {
    false
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".old");
    PathBuf::from(s)
}

#[cfg(unix)]
fn write_at(file: &File, path: &Path, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(buf, offset).map_err(|e| Error::io("write", path, e))
}

#[cfg(not(unix))]
fn write_at(file: &File, path: &Path, offset: u64, buf: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone().map_err(|e| Error::io("write", path, e))?;
    f.seek(SeekFrom::Start(offset)).map_err(|e| Error::io("write", path, e))?;
    f.write_all(buf).map_err(|e| Error::io("write", path, e))
}

/// A handle is its own synchronizer: the revision pair lives in the
/// header, so an external synchronizer component just calls through.
impl Synchronizer for Handle {
    fn set_revision(&self, revision: u64, rev_time: u64) {
        Handle::set_revision(self, revision, rev_time)
    }
    fn inc_revision(&self) -> u64 {
        Handle::inc_revision(self)
    }
    fn get_revision(&self) -> (u64, u64) {
        Handle::revision(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collab::{DefaultLegacyMigrator, SystemClock};

    fn tempdir() -> tempfile::TempDir {
        env_logger::try_init().ok();
        tempfile::tempdir().unwrap()
    }

    fn populate(dir: &tempfile::TempDir, name: &str, size: u64, entries: usize) -> PathBuf {
        let path = dir.path().join(name);
        format::create(&path, size, 1_700_000_000).unwrap();
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;
        let handle = Handle::open(&path, size, true, false, &clock, &migrator).unwrap();
        for i in 0..entries {
            let h1 = (i as u32).wrapping_mul(2_654_435_761).max(1);
            handle.put(h1, i as u32, 0, (i + 1) as f64, false);
        }
        handle.close();
        path
    }

    #[test]
    fn reindex_grows_and_preserves_every_entry() {
        let dir = tempdir();
        let path = populate(&dir, "grow.bin", 16 * 1024, 100);
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        let grown = Handle::open(&path, 65536, false, false, &clock, &migrator).unwrap();
        assert_eq!(grown.total_blocks(), (65536 - HEADER_SIZE as u64 - SECTION_HEADER_SIZE as u64) / BLOCK_SIZE as u64);

        for i in 0..100u32 {
            let h1 = i.wrapping_mul(2_654_435_761).max(1);
            assert_eq!(grown.get(h1, i, 0), (i + 1) as f64);
        }

        assert!(!backup_path(&path).exists(), "reindex must remove its backup file");
    }

    #[test]
    fn reindex_preserves_revision() {
        let dir = tempdir();
        let path = dir.path().join("rev.bin");
        format::create(&path, 16 * 1024, 1_700_000_000).unwrap();
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        {
            let handle = Handle::open(&path, 16 * 1024, true, false, &clock, &migrator).unwrap();
            handle.set_revision(42, 1_700_000_500);
            handle.close();
        }

        let grown = Handle::open(&path, 65536, false, false, &clock, &migrator).unwrap();
        assert_eq!(grown.revision(), (42, 1_700_000_500));
    }

    #[test]
    fn bad_magic_is_rejected_without_touching_the_file() {
        let dir = tempdir();
        let path = dir.path().join("bad.bin");
        format::create(&path, 65536, 1_700_000_000).unwrap();

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(b"xxx").unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;
        let err = Handle::open(&path, 65536, false, false, &clock, &migrator).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));

        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after, "a rejected open must not mutate the file");
    }

    #[test]
    fn put_then_get_round_trips_through_a_real_mapping() {
        let dir = tempdir();
        let path = dir.path().join("rt.bin");
        format::create(&path, 65536, 1_700_000_000).unwrap();
        let clock = SystemClock;
        let migrator = DefaultLegacyMigrator;

        let handle = Handle::open(&path, 65536, true, false, &clock, &migrator).unwrap();
        assert_eq!(handle.used_blocks(), 0);
        handle.put(123, 456, 0, 9.5, true);
        assert_eq!(handle.get(123, 456, 0), 9.5);
        assert_eq!(handle.used_blocks(), 1);
    }
}
