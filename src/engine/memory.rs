// Chunk Store
use bitvec::prelude::*;
use log::{debug, warn};
use memmap2::{MmapOptions, MmapRaw};
use num_complex::Complex64;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::engine::config::{AcquirePolicy, Backing, EngineConfig};
use crate::engine::error::{Result, SimError};

/// Complex128
pub const AMPLITUDE_BYTES: usize = std::mem::size_of::<Complex64>();

/// Medium that holds chunk contents while nobody has them acquired.
///
/// The store guarantees at most one outstanding `load` per chunk, so
/// implementations may assume exclusive access to the segment between a
/// `load` and its matching `store`.
pub trait ChunkBacking: Send + Sync {
    /// Move or copy the chunk into a private buffer.
    fn load(&self, chunk: usize) -> Result<Vec<Complex64>>;
    /// Hand the buffer back. `dirty` is false when it was only read.
    fn store(&self, chunk: usize, data: Vec<Complex64>, dirty: bool) -> Result<()>;
    fn medium(&self) -> &'static str;
}

/// Fixed set of `2^num_primary` chunks of `2^num_local` amplitudes each,
/// with single-writer acquisition.
pub struct ChunkStore {
    backing: Box<dyn ChunkBacking>,
    num_chunks: usize,
    chunk_len: usize,
    policy: AcquirePolicy,
    held: Mutex<BitVec>,
    released: Condvar,
}

impl ChunkStore {
    /// Allocate the configured medium and seed it with `|0…0⟩`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let num_chunks = pow2(config.num_primary, "chunk count")?;
        let chunk_len = pow2(config.num_local, "chunk length")?;
        let total_bytes = num_chunks
            .checked_mul(chunk_len)
            .and_then(|n| n.checked_mul(AMPLITUDE_BYTES))
            .ok_or_else(|| {
                SimError::resource(format!(
                    "{} amplitudes do not fit in the address space",
                    config.num_qubits()
                ))
            })?;

        let backing: Box<dyn ChunkBacking> = match &config.backing {
            Backing::Memory { max_bytes } => {
                if let Some(limit) = max_bytes {
                    if total_bytes as u64 > *limit {
                        return Err(SimError::resource(format!(
                            "{total_bytes} bytes of chunks exceed the {limit} byte memory budget"
                        )));
                    }
                }
                Box::new(MemoryBacking::new(num_chunks, chunk_len)?)
            }
            Backing::Mmap { path } => Box::new(MmapBacking::new(path, num_chunks, chunk_len)?),
            #[cfg(feature = "io-uring")]
            Backing::Uring { path, queue_depth } => Box::new(
                crate::engine::io::UringBacking::new(path, num_chunks, chunk_len, *queue_depth)?,
            ),
        };
        debug!(
            target: "qp_chunk_sim::memory",
            "Opened {} chunks x {} amplitudes on {}",
            num_chunks,
            chunk_len,
            backing.medium()
        );
        Ok(Self::with_backing(backing, num_chunks, chunk_len, config.acquire_policy))
    }

    /// Wrap an already-seeded backing.
    pub fn with_backing(
        backing: Box<dyn ChunkBacking>,
        num_chunks: usize,
        chunk_len: usize,
        policy: AcquirePolicy,
    ) -> Self {
        Self {
            backing,
            num_chunks,
            chunk_len,
            policy,
            held: Mutex::new(bitvec![0; num_chunks]),
            released: Condvar::new(),
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn medium(&self) -> &'static str {
        self.backing.medium()
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    /// Exclusive read-write access to one chunk.
    pub fn acquire(&self, chunk: usize) -> Result<ChunkGuard<'_>> {
        if chunk >= self.num_chunks {
            return Err(SimError::resource(format!(
                "chunk {chunk} does not exist (store has {})",
                self.num_chunks
            )));
        }
        self.lock_chunk(chunk)?;
        match self.backing.load(chunk) {
            Ok(data) => Ok(ChunkGuard {
                store: self,
                chunk,
                data: Some(data),
                dirty: false,
            }),
            Err(err) => {
                self.unlock_chunk(chunk);
                Err(err)
            }
        }
    }

    /// Acquire several chunks, returned in the order requested.
    ///
    /// Locks are taken in ascending id order so concurrent group
    /// acquisitions cannot deadlock.
    pub fn acquire_group(&self, chunks: &[usize]) -> Result<Vec<ChunkGuard<'_>>> {
        let mut order: Vec<usize> = (0..chunks.len()).collect();
        order.sort_by_key(|&i| chunks[i]);
        // A repeated id would wait on its own lock forever
        if let Some(pair) = order.windows(2).find(|w| chunks[w[0]] == chunks[w[1]]) {
            return Err(SimError::DuplicateChunk {
                chunk: chunks[pair[0]],
            });
        }
        let mut slots: Vec<Option<ChunkGuard<'_>>> = (0..chunks.len()).map(|_| None).collect();
        // On error the guards acquired so far drop and release themselves.
        for i in order {
            slots[i] = Some(self.acquire(chunks[i])?);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Whether some acquirer currently holds `chunk`.
    pub fn is_held(&self, chunk: usize) -> bool {
        let held = self.held_table();
        let busy = held.get(chunk).is_some_and(|bit| *bit);
        busy
    }

    fn held_table(&self) -> MutexGuard<'_, BitVec> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_chunk(&self, chunk: usize) -> Result<()> {
        let mut held = self.held_table();
        while held[chunk] {
            match self.policy {
                AcquirePolicy::NonBlocking => return Err(SimError::ChunkBusy { chunk }),
                AcquirePolicy::Blocking => {
                    held = self
                        .released
                        .wait(held)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        held.set(chunk, true);
        Ok(())
    }

    fn unlock_chunk(&self, chunk: usize) {
        self.held_table().set(chunk, false);
        self.released.notify_all();
    }

    fn finish(&self, chunk: usize, data: Vec<Complex64>, dirty: bool) -> Result<()> {
        // The lock bit is cleared only after the write-back lands, so a later
        // acquirer never observes a partial chunk.
        let outcome = self.backing.store(chunk, data, dirty);
        self.unlock_chunk(chunk);
        outcome
    }
}

fn pow2(bits: usize, what: &str) -> Result<usize> {
    1usize
        .checked_shl(bits as u32)
        .filter(|_| bits < usize::BITS as usize)
        .ok_or_else(|| SimError::resource(format!("{what} 2^{bits} overflows the address space")))
}

/// Exclusive handle on one acquired chunk. Dereferences to its amplitudes.
///
/// `release` writes the chunk back and reports failures; dropping the guard
/// does the same but can only log them.
pub struct ChunkGuard<'a> {
    store: &'a ChunkStore,
    chunk: usize,
    data: Option<Vec<Complex64>>,
    dirty: bool,
}

impl ChunkGuard<'_> {
    pub fn id(&self) -> usize {
        self.chunk
    }

    pub fn release(mut self) -> Result<()> {
        match self.data.take() {
            Some(data) => self.store.finish(self.chunk, data, self.dirty),
            None => Ok(()),
        }
    }
}

impl Deref for ChunkGuard<'_> {
    type Target = [Complex64];

    fn deref(&self) -> &[Complex64] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for ChunkGuard<'_> {
    fn deref_mut(&mut self) -> &mut [Complex64] {
        self.dirty = true;
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Err(err) = self.store.finish(self.chunk, data, self.dirty) {
                warn!(
                    target: "qp_chunk_sim::memory",
                    "Write-back of chunk {} failed on drop: {}",
                    self.chunk,
                    err
                );
            }
        }
    }
}

/// Release every guard, reporting the first failure after trying them all.
pub fn release_all(guards: Vec<ChunkGuard<'_>>) -> Result<()> {
    let mut first_err = None;
    for guard in guards {
        if let Err(err) = guard.release() {
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn zeroed_chunk(chunk_len: usize) -> Result<Vec<Complex64>> {
    let mut data = Vec::new();
    data.try_reserve_exact(chunk_len).map_err(|e| {
        SimError::resource(format!("cannot allocate a {chunk_len}-amplitude chunk: {e}"))
    })?;
    data.resize(chunk_len, Complex64::new(0.0, 0.0));
    Ok(data)
}

/// Heap-resident chunks. Acquisition moves the buffer out, release moves it back.
pub struct MemoryBacking {
    slots: Vec<Mutex<Vec<Complex64>>>,
}

impl MemoryBacking {
    pub fn new(num_chunks: usize, chunk_len: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(num_chunks).map_err(|e| {
            SimError::resource(format!("cannot allocate {num_chunks} chunk slots: {e}"))
        })?;
        for _ in 0..num_chunks {
            slots.push(Mutex::new(zeroed_chunk(chunk_len)?));
        }
        if let Some(first) = slots.first_mut() {
            let first = first.get_mut().unwrap_or_else(PoisonError::into_inner);
            first[0] = Complex64::new(1.0, 0.0);
        }
        Ok(Self { slots })
    }
}

impl ChunkBacking for MemoryBacking {
    fn load(&self, chunk: usize) -> Result<Vec<Complex64>> {
        let mut slot = self.slots[chunk]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *slot))
    }

    fn store(&self, chunk: usize, data: Vec<Complex64>, _dirty: bool) -> Result<()> {
        *self.slots[chunk]
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }

    fn medium(&self) -> &'static str {
        "memory"
    }
}

/// Chunks laid out back to back in one memory-mapped file.
///
/// Acquired chunks are copied into DRAM buffers; on release they are written
/// back and their pages are handed back to the OS.
pub struct MmapBacking {
    mapping: MmapRaw,
    _file: File, // Keep file handle open
    chunk_len: usize,
    page_size: usize,
}

impl MmapBacking {
    /// Create (or truncate) the backing file on secondary storage.
    pub fn new(path: &Path, num_chunks: usize, chunk_len: usize) -> Result<Self> {
        let chunk_bytes = chunk_len * AMPLITUDE_BYTES;
        let total_bytes = num_chunks * chunk_bytes;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SimError::resource(format!("cannot open {}: {e}", path.display())))?;
        // Truncate-then-extend leaves a sparse, all-zero file
        file.set_len(total_bytes as u64).map_err(|e| {
            SimError::resource(format!(
                "cannot reserve {total_bytes} bytes in {}: {e}",
                path.display()
            ))
        })?;
        let mapping = MmapOptions::new().map_raw(&file)?;
        // Advice OS: We will manage paging ourselves, don't use standard read-ahead
        #[cfg(unix)]
        unsafe {
            libc::madvise(
                mapping.as_mut_ptr() as *mut _,
                total_bytes,
                libc::MADV_RANDOM,
            );
        }
        let backing = Self {
            mapping,
            _file: file,
            chunk_len,
            page_size: page_size(),
        };
        backing.store(0, vec![Complex64::new(1.0, 0.0)], true)?;
        Ok(backing)
    }

    fn segment(&self, chunk: usize) -> *mut Complex64 {
        let offset = chunk * self.chunk_len * AMPLITUDE_BYTES;
        // Safety: `chunk` < num_chunks, so the segment lies inside the mapping
        unsafe { self.mapping.as_mut_ptr().add(offset) as *mut Complex64 }
    }

    /// Drop the whole pages covered by a chunk from the resident set.
    fn evict(&self, chunk: usize) {
        let start = chunk * self.chunk_len * AMPLITUDE_BYTES;
        let end = start + self.chunk_len * AMPLITUDE_BYTES;
        let first_page = start.div_ceil(self.page_size) * self.page_size;
        let last_page = end / self.page_size * self.page_size;
        if last_page <= first_page {
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::madvise(
                self.mapping.as_mut_ptr().add(first_page) as *mut _,
                last_page - first_page,
                libc::MADV_DONTNEED, // Aggressively free RAM
            );
        }
    }
}

impl ChunkBacking for MmapBacking {
    fn load(&self, chunk: usize) -> Result<Vec<Complex64>> {
        let mut data = zeroed_chunk(self.chunk_len)?;
        // Safety: the store holds this chunk's lock, so no writer touches the segment
        unsafe {
            std::ptr::copy_nonoverlapping(self.segment(chunk), data.as_mut_ptr(), self.chunk_len);
        }
        Ok(data)
    }

    fn store(&self, chunk: usize, data: Vec<Complex64>, dirty: bool) -> Result<()> {
        if dirty {
            let len = data.len().min(self.chunk_len);
            // Safety: as in `load`; segments of distinct chunks never overlap
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.segment(chunk), len);
            }
        }
        self.evict(chunk);
        Ok(())
    }

    fn medium(&self) -> &'static str {
        "mmap"
    }
}

impl Drop for MmapBacking {
    fn drop(&mut self) {
        // Ensure data hits the disk before we close
        let _ = self.mapping.flush();
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}
