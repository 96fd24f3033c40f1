//! On-disk statfile format: header, section headers, and blocks.
//!
//! Mirrors the byte layout of rspamd's `mmaped_file.c` backend. Fields are
//! decoded straight out of byte ranges (no raw pointer casts into the
//! mmap), the same way `parity-db`'s `table.rs` reads its 16-byte entry
//! header with `u64::from_le_bytes` on explicit slices — this keeps the
//! accessors safe even though the backing memory is a live mmap that other
//! processes may be writing to concurrently.
use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{Error, Result};

pub const MAGIC: [u8; 3] = *b"rsd";
pub const VERSION: [u8; 2] = *b"12";
pub const LEGACY_VERSION: [u8; 2] = [1, 0];

pub const HEADER_SIZE: usize = 256;
pub const SECTION_HEADER_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
pub const CHAIN_LENGTH: u64 = 128;

pub const SECTION_COMMON: u64 = 1;
pub const SECTION_HEADERS: u64 = 2;
pub const SECTION_URLS: u64 = 3;
pub const SECTION_REGEXP: u64 = 4;

/// Number of blocks written per batch when zero-filling a new file.
/// Matches the 256-block write buffer in the original C implementation.
const CREATE_BATCH_BLOCKS: usize = 256;

/// Byte-offset accessors into the 256-byte header. All fields are
/// little-endian regardless of host layout for the in-scope code path;
/// porting across endian boundaries needs an explicit conversion pass
/// (not performed here, see spec §6.1).
pub mod header {
    use super::HEADER_SIZE;

    pub const MAGIC: std::ops::Range<usize> = 0..3;
    pub const VERSION: std::ops::Range<usize> = 3..5;
    pub const PADDING: std::ops::Range<usize> = 5..8;
    pub const CREATE_TIME: std::ops::Range<usize> = 8..16;
    pub const REVISION: std::ops::Range<usize> = 16..24;
    pub const REV_TIME: std::ops::Range<usize> = 24..32;
    pub const USED_BLOCKS: std::ops::Range<usize> = 32..40;
    pub const TOTAL_BLOCKS: std::ops::Range<usize> = 40..48;
    // The original C `unused[239]` does not actually reconcile with a
    // 256-byte header once u64 alignment is taken into account (8 + 5*8 +
    // 239 = 287). The testable properties in spec §8 pin the header at
    // exactly 256 bytes (`nblocks = (size-256-16)/16`), so that figure
    // governs here; the reserved tail is sized to fit.
    pub const RESERVED: std::ops::Range<usize> = 48..HEADER_SIZE;

    pub fn magic(bytes: &[u8]) -> [u8; 3] {
        bytes[MAGIC].try_into().unwrap()
    }
    pub fn set_magic(bytes: &mut [u8], magic: [u8; 3]) {
        bytes[MAGIC].copy_from_slice(&magic);
    }
    pub fn version(bytes: &[u8]) -> [u8; 2] {
        bytes[VERSION].try_into().unwrap()
    }
    pub fn set_version(bytes: &mut [u8], version: [u8; 2]) {
        bytes[VERSION].copy_from_slice(&version);
    }
    pub fn create_time(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[CREATE_TIME].try_into().unwrap())
    }
    pub fn set_create_time(bytes: &mut [u8], v: u64) {
        bytes[CREATE_TIME].copy_from_slice(&v.to_le_bytes());
    }
    pub fn revision(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[REVISION].try_into().unwrap())
    }
    pub fn set_revision(bytes: &mut [u8], v: u64) {
        bytes[REVISION].copy_from_slice(&v.to_le_bytes());
    }
    pub fn rev_time(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[REV_TIME].try_into().unwrap())
    }
    pub fn set_rev_time(bytes: &mut [u8], v: u64) {
        bytes[REV_TIME].copy_from_slice(&v.to_le_bytes());
    }
    pub fn used_blocks(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[USED_BLOCKS].try_into().unwrap())
    }
    pub fn set_used_blocks(bytes: &mut [u8], v: u64) {
        bytes[USED_BLOCKS].copy_from_slice(&v.to_le_bytes());
    }
    pub fn incr_used_blocks(bytes: &mut [u8]) {
        let v = used_blocks(bytes);
        set_used_blocks(bytes, v + 1);
    }
    pub fn total_blocks(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[TOTAL_BLOCKS].try_into().unwrap())
    }
    pub fn set_total_blocks(bytes: &mut [u8], v: u64) {
        bytes[TOTAL_BLOCKS].copy_from_slice(&v.to_le_bytes());
    }
}

/// Byte-offset accessors for a 16-byte section header.
pub mod section {
    pub const CODE: std::ops::Range<usize> = 0..8;
    pub const LENGTH: std::ops::Range<usize> = 8..16;

    pub fn code(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[CODE].try_into().unwrap())
    }
    pub fn set_code(bytes: &mut [u8], v: u64) {
        bytes[CODE].copy_from_slice(&v.to_le_bytes());
    }
    pub fn length(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[LENGTH].try_into().unwrap())
    }
    pub fn set_length(bytes: &mut [u8], v: u64) {
        bytes[LENGTH].copy_from_slice(&v.to_le_bytes());
    }
}

/// Byte-offset accessors for a single 16-byte block, relative to the
/// start of a block array. `idx` is the block's position within that
/// array (not an absolute file offset).
pub mod block {
    use super::BLOCK_SIZE;

    #[inline]
    fn at(idx: u64) -> std::ops::Range<usize> {
        let start = idx as usize * BLOCK_SIZE;
        start..start + BLOCK_SIZE
    }

    pub fn hash1(blocks: &[u8], idx: u64) -> u32 {
        let r = at(idx);
        u32::from_le_bytes(blocks[r.start..r.start + 4].try_into().unwrap())
    }
    pub fn hash2(blocks: &[u8], idx: u64) -> u32 {
        let r = at(idx);
        u32::from_le_bytes(blocks[r.start + 4..r.start + 8].try_into().unwrap())
    }
    pub fn value(blocks: &[u8], idx: u64) -> f64 {
        let r = at(idx);
        f64::from_le_bytes(blocks[r.start + 8..r.end].try_into().unwrap())
    }
    pub fn is_free(blocks: &[u8], idx: u64) -> bool {
        hash1(blocks, idx) == 0 && hash2(blocks, idx) == 0
    }
    pub fn set(blocks: &mut [u8], idx: u64, h1: u32, h2: u32, value: f64) {
        let r = at(idx);
        blocks[r.start..r.start + 4].copy_from_slice(&h1.to_le_bytes());
        blocks[r.start + 4..r.start + 8].copy_from_slice(&h2.to_le_bytes());
        blocks[r.start + 8..r.end].copy_from_slice(&value.to_le_bytes());
    }
    pub fn set_value(blocks: &mut [u8], idx: u64, value: f64) {
        let r = at(idx);
        blocks[r.start + 8..r.end].copy_from_slice(&value.to_le_bytes());
    }
}

/// Validate header + first section of a mapping. `legacy_upgrade` is
/// invoked for a `{1,0}` header before re-validating (spec §4.1, §6.2).
pub fn validate<F>(mmap: &mut [u8], path: &Path, legacy_upgrade: F) -> Result<()>
where
    F: FnOnce(&mut [u8]) -> Result<()>,
{
    let minimum = (HEADER_SIZE + SECTION_HEADER_SIZE + BLOCK_SIZE) as u64;
    if (mmap.len() as u64) < minimum {
        return Err(Error::FileTooSmall { size: mmap.len() as u64, minimum });
    }

    if header::magic(mmap) != MAGIC {
        return Err(Error::BadMagic { path: path.to_path_buf() });
    }

    let version = header::version(mmap);
    if version == LEGACY_VERSION {
        legacy_upgrade(mmap)?;
        // Re-check after migration; the migrator is expected to have
        // written the current version in place.
        if header::version(mmap) != VERSION {
            return Err(Error::BadVersion(header::version(mmap)));
        }
    } else if version != VERSION {
        return Err(Error::BadVersion(version));
    }

    let sect = &mmap[HEADER_SIZE..HEADER_SIZE + SECTION_HEADER_SIZE];
    let length = section::length(sect);
    let needed = HEADER_SIZE as u64 + SECTION_HEADER_SIZE as u64 + length * BLOCK_SIZE as u64;
    if needed > mmap.len() as u64 {
        return Err(Error::Truncated { actual: mmap.len() as u64, expected: needed });
    }

    Ok(())
}

/// Create a new statfile of `size` bytes: header, one `common` section,
/// and `nblocks` zeroed blocks written in batches.
pub fn create(path: &Path, size: u64, now: u64) -> Result<()> {
    let minimum = (HEADER_SIZE + SECTION_HEADER_SIZE + BLOCK_SIZE) as u64;
    if size < minimum {
        return Err(Error::FileTooSmall { size, minimum });
    }

    let nblocks = (size - HEADER_SIZE as u64 - SECTION_HEADER_SIZE as u64) / BLOCK_SIZE as u64;
    if nblocks < 1 {
        return Err(Error::FileTooSmall { size, minimum });
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::io("create", path, e))?;

    preallocate(&file, path, size)?;

    let mut header_buf = [0u8; HEADER_SIZE];
    header::set_magic(&mut header_buf, MAGIC);
    header::set_version(&mut header_buf, VERSION);
    header::set_create_time(&mut header_buf, now);
    header::set_total_blocks(&mut header_buf, nblocks);

    write_at(&file, path, 0, &header_buf)?;

    let mut sect_buf = [0u8; SECTION_HEADER_SIZE];
    section::set_code(&mut sect_buf, SECTION_COMMON);
    section::set_length(&mut sect_buf, nblocks);
    write_at(&file, path, HEADER_SIZE as u64, &sect_buf)?;

    let batch = vec![0u8; CREATE_BATCH_BLOCKS * BLOCK_SIZE];
    let mut remaining = nblocks;
    let mut offset = (HEADER_SIZE + SECTION_HEADER_SIZE) as u64;
    while remaining > 0 {
        let this_batch = remaining.min(CREATE_BATCH_BLOCKS as u64);
        let bytes = &batch[..this_batch as usize * BLOCK_SIZE];
        write_at(&file, path, offset, bytes)?;
        offset += bytes.len() as u64;
        remaining -= this_batch;
    }

    log::debug!(target: "statfile", "created statfile {} with {} blocks", path.display(), nblocks);
    Ok(())
}

#[cfg(unix)]
fn preallocate(file: &File, path: &Path, size: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) };
    if ret != 0 {
        return Err(Error::io("fallocate", path, std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn preallocate(file: &File, path: &Path, size: u64) -> Result<()> {
    file.set_len(size).map_err(|e| Error::io("fallocate", path, e))
}

#[cfg(unix)]
fn write_at(file: &File, path: &Path, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(|e| Error::io("write", path, e))
}

#[cfg(not(unix))]
fn write_at(file: &File, path: &Path, offset: u64, buf: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone().map_err(|e| Error::io("write", path, e))?;
    f.seek(SeekFrom::Start(offset)).map_err(|e| Error::io("write", path, e))?;
    f.write_all(buf).map_err(|e| Error::io("write", path, e))
}

/// Walk section headers looking for `code`, starting either at the
/// beginning of the file or immediately after the handle's current
/// cursor. Returns `(seek_pos, length_in_blocks)` of the matching
/// section's block array, per spec §4.1 / §9 (length on disk is blocks,
/// converted to a byte span when stepping between sections).
pub fn locate_section(
    mmap: &[u8],
    code: u64,
    from_beginning: bool,
    cur_seek_pos: usize,
) -> Option<(usize, u64)> {
    let mut cur_offset = if from_beginning {
        HEADER_SIZE
    } else {
        cur_seek_pos.checked_sub(SECTION_HEADER_SIZE)?
    };

    while cur_offset + SECTION_HEADER_SIZE <= mmap.len() {
        let sect = &mmap[cur_offset..cur_offset + SECTION_HEADER_SIZE];
        let sect_code = section::code(sect);
        let length = section::length(sect);
        if sect_code == code {
            return Some((cur_offset + SECTION_HEADER_SIZE, length));
        }
        let span = SECTION_HEADER_SIZE + length as usize * BLOCK_SIZE;
        if span == 0 {
            break;
        }
        cur_offset += span;
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn tempdir() -> tempfile::TempDir {
        env_logger::try_init().ok();
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn magic_and_version_bytes() {
        assert_eq!(&MAGIC, b"rsd");
        assert_eq!(&VERSION, b"12");
    }

    #[test]
    fn create_computes_capacity_from_size() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 65536);
        assert_eq!(header::magic(&bytes), MAGIC);
        assert_eq!(header::version(&bytes), VERSION);
        assert_eq!(header::create_time(&bytes), 1_700_000_000);

        let expected_blocks = (65536 - HEADER_SIZE as u64 - SECTION_HEADER_SIZE as u64) / BLOCK_SIZE as u64;
        assert_eq!(header::total_blocks(&bytes), expected_blocks);

        let sect = &bytes[HEADER_SIZE..HEADER_SIZE + SECTION_HEADER_SIZE];
        assert_eq!(section::code(sect), SECTION_COMMON);
        assert_eq!(section::length(sect), expected_blocks);
    }

    #[test]
    fn reopening_exposes_the_same_capacity() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();
        let first = std::fs::read(&path).unwrap();

        let mut second = std::fs::read(&path).unwrap();
        validate(&mut second, &path, |_| Ok(())).unwrap();
        assert_eq!(header::total_blocks(&first), header::total_blocks(&second));
    }

    #[test]
    fn validate_rejects_bad_magic_without_modifying_the_file() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'x';
        let before = bytes.clone();

        let err = validate(&mut bytes, &path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));
        assert_eq!(bytes, before, "a rejected validate must not mutate the buffer");
    }

    #[test]
    fn validate_rejects_truncated_section() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(HEADER_SIZE + SECTION_HEADER_SIZE + BLOCK_SIZE);
        let err = validate(&mut bytes, &path, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn legacy_header_is_upgraded_in_place() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        header::set_version(&mut bytes, LEGACY_VERSION);

        validate(&mut bytes, &path, |b| {
            header::set_version(b, VERSION);
            Ok(())
        })
        .unwrap();
        assert_eq!(header::version(&bytes), VERSION);
    }

    #[test]
    fn locate_section_finds_the_only_section_from_the_beginning() {
        let dir = tempdir();
        let path = dir.path().join("stat.bin");
        create(&path, 65536, 1_700_000_000).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let (seek_pos, length) = locate_section(&bytes, SECTION_COMMON, true, 0).unwrap();
        assert_eq!(seek_pos, HEADER_SIZE + SECTION_HEADER_SIZE);
        assert_eq!(length, header::total_blocks(&bytes));
        assert!(locate_section(&bytes, SECTION_URLS, true, 0).is_none());
    }
}
