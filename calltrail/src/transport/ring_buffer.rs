//! # Telemetry Ring Buffer
//!
//! Shared-memory region the target appends `[id][timestamp]` records into.
//!
//! ## Layout
//!
//! ```text
//! offset 0          W         2W        3W        4W
//!        | id       | time     | id       | time     | ...
//! ```
//!
//! `W` is 4 bytes for 32-bit targets and 8 for 64-bit ones. The target
//! advertises how many records are valid through `C:GetCounts`; the consumer
//! turns that into a logical end with [`RingReader::set_logical_size`].
//!
//! ## Consistency
//!
//! Single producer in another process, single consumer here, no fences. A
//! reader only trusts a record when both fields are non-zero, and the
//! producer writes the timestamp before the id. When the producer reports a
//! size the cursor has already passed, the cursor restarts at 0 and the
//! records in between are lost.

use calltrail_common::{FIELDS_PER_RECORD, NARROW_FIELD_BYTES, WIDE_FIELD_BYTES};
use log::{debug, info};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// One field of a record slot: `u32` for 32-bit targets, `u64` for 64-bit.
pub trait RecordField: Copy + Send + Sync + 'static {
    /// Width in bytes
    const WIDTH: usize;

    fn to_u64(self) -> u64;

    /// Narrowing conversion used by the producer side
    fn from_u64(value: u64) -> Self;
}

impl RecordField for u32 {
    const WIDTH: usize = NARROW_FIELD_BYTES;

    fn to_u64(self) -> u64 {
        u64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_u64(value: u64) -> Self {
        value as u32
    }
}

impl RecordField for u64 {
    const WIDTH: usize = WIDE_FIELD_BYTES;

    fn to_u64(self) -> u64 {
        self
    }

    fn from_u64(value: u64) -> Self {
        value
    }
}

// ============================================================================
// Shared Region
// ============================================================================

/// A file-backed memory mapping shared with the target process.
///
/// A region made with [`SharedRegion::create`] owns its backing file and
/// removes it on drop. One made with [`SharedRegion::open`] only maps it.
#[derive(Debug)]
pub struct SharedRegion {
    map: MmapMut,
    path: PathBuf,
    owned: bool,
}

impl SharedRegion {
    /// Create a zero-filled region of `size` bytes at `dir/name`.
    ///
    /// # Errors
    /// Returns an error if `size` is zero or the file cannot be created and mapped.
    pub fn create(dir: &Path, name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "shared region size is zero"));
        }
        let path = dir.join(name);
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        // Sparse: pages are only backed once the producer touches them.
        file.set_len(size as u64)?;

        // SAFETY: the file was just created by us with a fixed length; the
        // target only writes within that length and we never truncate it.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file)? };

        info!("Created shared region {} ({size} bytes)", path.display());
        Ok(Self { map, path, owned: true })
    }

    /// Map an existing region created by the other side.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // SAFETY: the creator keeps the file length fixed for the region's lifetime.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self { map, path, owned: false })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Volatile load of the field at `offset`. Out-of-range or misaligned
    /// offsets read as zero.
    fn load<F: RecordField>(&self, offset: usize) -> F {
        if !Self::in_bounds::<F>(offset, self.map.len()) {
            return F::from_u64(0);
        }
        // SAFETY: offset + WIDTH is within the mapping and offset is a
        // multiple of WIDTH; the mapping itself is page-aligned.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::read_volatile(self.map.as_ptr().add(offset).cast::<F>())
        }
    }

    fn store<F: RecordField>(&mut self, offset: usize, value: F) -> bool {
        if !Self::in_bounds::<F>(offset, self.map.len()) {
            return false;
        }
        // SAFETY: same bounds and alignment argument as `load`.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::write_volatile(self.map.as_mut_ptr().add(offset).cast::<F>(), value);
        }
        true
    }

    fn in_bounds<F: RecordField>(offset: usize, len: usize) -> bool {
        offset % F::WIDTH == 0 && offset.checked_add(F::WIDTH).is_some_and(|end| end <= len)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owned {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed shared region {}", self.path.display()),
                Err(e) => debug!("Failed to remove shared region {}: {e}", self.path.display()),
            }
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer-side cursor over the record stream.
#[derive(Debug)]
pub struct RingReader<F: RecordField> {
    region: SharedRegion,
    cursor: usize,
    logical_end: usize,
    _field: PhantomData<F>,
}

impl<F: RecordField> RingReader<F> {
    /// Bytes per `[id][timestamp]` record
    pub const RECORD_BYTES: usize = F::WIDTH * FIELDS_PER_RECORD;

    #[must_use]
    pub fn new(region: SharedRegion) -> Self {
        Self { region, cursor: 0, logical_end: 0, _field: PhantomData }
    }

    /// Advertise how many records the producer has written.
    ///
    /// The end is clamped to the mapping. If the cursor is already past the
    /// new end, the producer has wrapped: restart from 0.
    pub fn set_logical_size(&mut self, calls: u64) {
        let requested = usize::try_from(calls)
            .ok()
            .and_then(|calls| calls.checked_mul(Self::RECORD_BYTES))
            .unwrap_or(usize::MAX);
        let capacity = self.region.len() - self.region.len() % Self::RECORD_BYTES;
        self.logical_end = requested.min(capacity);

        if self.cursor > self.logical_end {
            info!("Record buffer wrapped at offset {}, restarting from 0", self.cursor);
            self.cursor = 0;
        }
    }

    /// Read the record at the cursor.
    ///
    /// `(0, 0)` means nothing is readable yet: the cursor is at the logical
    /// end, or the slot is still being written. The cursor only advances
    /// past a record whose id and timestamp are both non-zero.
    pub fn read_record(&mut self) -> (u64, u64) {
        if self.cursor + Self::RECORD_BYTES > self.logical_end {
            return (0, 0);
        }

        let id = self.region.load::<F>(self.cursor).to_u64();
        if id == 0 {
            return (0, 0);
        }
        let timestamp = self.region.load::<F>(self.cursor + F::WIDTH).to_u64();
        if timestamp == 0 {
            return (0, 0);
        }

        self.cursor += Self::RECORD_BYTES;
        (id, timestamp)
    }

    /// Reset the cursor to `position` (clamped to the logical end).
    pub fn move_to(&mut self, position: usize) {
        self.cursor = position.min(self.logical_end);
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn logical_end(&self) -> usize {
        self.logical_end
    }

    #[must_use]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

/// Record reader picked once per attach from the target's bitness.
#[derive(Debug)]
pub enum TelemetryBuffer {
    Narrow(RingReader<u32>),
    Wide(RingReader<u64>),
}

impl TelemetryBuffer {
    #[must_use]
    pub fn for_target(region: SharedRegion, is_64bit: bool) -> Self {
        if is_64bit {
            Self::Wide(RingReader::new(region))
        } else {
            Self::Narrow(RingReader::new(region))
        }
    }

    /// Bytes per field: 4 or 8
    #[must_use]
    pub fn field_width(&self) -> usize {
        match self {
            Self::Narrow(_) => u32::WIDTH,
            Self::Wide(_) => u64::WIDTH,
        }
    }

    pub fn set_logical_size(&mut self, calls: u64) {
        match self {
            Self::Narrow(r) => r.set_logical_size(calls),
            Self::Wide(r) => r.set_logical_size(calls),
        }
    }

    pub fn read_record(&mut self) -> (u64, u64) {
        match self {
            Self::Narrow(r) => r.read_record(),
            Self::Wide(r) => r.read_record(),
        }
    }

    pub fn move_to(&mut self, position: usize) {
        match self {
            Self::Narrow(r) => r.move_to(position),
            Self::Wide(r) => r.move_to(position),
        }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        match self {
            Self::Narrow(r) => r.position(),
            Self::Wide(r) => r.position(),
        }
    }

    #[must_use]
    pub fn logical_end(&self) -> usize {
        match self {
            Self::Narrow(r) => r.logical_end(),
            Self::Wide(r) => r.logical_end(),
        }
    }

    #[must_use]
    pub fn region(&self) -> &SharedRegion {
        match self {
            Self::Narrow(r) => r.region(),
            Self::Wide(r) => r.region(),
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Producer side: appends records the way an instrumented target does.
#[derive(Debug)]
pub struct RingWriter<F: RecordField> {
    region: SharedRegion,
    cursor: usize,
    _field: PhantomData<F>,
}

impl<F: RecordField> RingWriter<F> {
    #[must_use]
    pub fn new(region: SharedRegion) -> Self {
        Self { region, cursor: 0, _field: PhantomData }
    }

    /// Append one record. Returns `false` once the region is full.
    pub fn append(&mut self, id: u64, timestamp: u64) -> bool {
        let record = F::WIDTH * FIELDS_PER_RECORD;
        if self.cursor + record > self.region.len() {
            return false;
        }
        // Timestamp first: a reader that sees the id also sees the time.
        let stored = self.region.store(self.cursor + F::WIDTH, F::from_u64(timestamp))
            && self.region.store(self.cursor, F::from_u64(id));
        if stored {
            self.cursor += record;
        }
        stored
    }

    /// Records written since the last reset
    #[must_use]
    pub fn calls(&self) -> u64 {
        (self.cursor / (F::WIDTH * FIELDS_PER_RECORD)) as u64
    }

    /// Zero everything written so far and start over at offset 0.
    pub fn reset(&mut self) {
        let mut offset = 0;
        while offset < self.cursor {
            self.region.store(offset, F::from_u64(0));
            offset += F::WIDTH;
        }
        self.cursor = 0;
    }
}
