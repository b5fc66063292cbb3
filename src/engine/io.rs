// Async I/O Engine
use io_uring::{opcode, types, IoUring};
use num_complex::Complex64;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::engine::error::{Result, SimError};
use crate::engine::memory::{ChunkBacking, AMPLITUDE_BYTES};

// Largest single transfer handed to one submission entry
const MAX_TRANSFER: usize = 1 << 30;

/// Chunk segments in a plain file, moved with pread/pwrite-style io_uring
/// submissions instead of a memory mapping.
///
/// One ring serves all chunks; submissions are serialized through it.
pub struct UringBacking {
    ring: Mutex<IoUring>,
    file: File,
    chunk_len: usize,
}

impl UringBacking {
    pub fn new(path: &Path, num_chunks: usize, chunk_len: usize, queue_depth: u32) -> Result<Self> {
        let total_bytes = num_chunks * chunk_len * AMPLITUDE_BYTES;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SimError::resource(format!("cannot open {}: {e}", path.display())))?;
        file.set_len(total_bytes as u64).map_err(|e| {
            SimError::resource(format!(
                "cannot reserve {total_bytes} bytes in {}: {e}",
                path.display()
            ))
        })?;
        let ring = IoUring::new(queue_depth.max(1))?;
        let backing = Self {
            ring: Mutex::new(ring),
            file,
            chunk_len,
        };
        backing.store(0, vec![Complex64::new(1.0, 0.0)], true)?;
        Ok(backing)
    }

    fn chunk_offset(&self, chunk: usize) -> u64 {
        (chunk * self.chunk_len * AMPLITUDE_BYTES) as u64
    }

    /// Run one read or write to completion, resubmitting short transfers.
    fn transfer(&self, write: bool, buf: *mut u8, len: usize, offset: u64) -> io::Result<()> {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let fd = types::Fd(self.file.as_raw_fd());
        let mut done = 0usize;
        while done < len {
            let step = (len - done).min(MAX_TRANSFER) as u32;
            // Safety: `buf` spans `len` bytes owned by the caller for this call
            let ptr = unsafe { buf.add(done) };
            let pos = offset + done as u64;
            let entry = if write {
                opcode::Write::new(fd, ptr as *const u8, step)
                    .offset(pos)
                    .build()
                    .user_data(pos)
            } else {
                opcode::Read::new(fd, ptr, step)
                    .offset(pos)
                    .build()
                    .user_data(pos)
            };
            // Safety: the buffer outlives the submission; we wait for it below
            unsafe {
                ring.submission()
                    .push(&entry)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;
            }
            ring.submit_and_wait(1)?;
            let completion = ring
                .completion()
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "missing completion"))?;
            let res = completion.result();
            if res < 0 {
                return Err(io::Error::from_raw_os_error(-res));
            }
            if res == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("zero-length transfer at byte {pos}"),
                ));
            }
            done += res as usize;
        }
        Ok(())
    }
}

impl ChunkBacking for UringBacking {
    fn load(&self, chunk: usize) -> Result<Vec<Complex64>> {
        let mut data = vec![Complex64::new(0.0, 0.0); self.chunk_len];
        self.transfer(
            false,
            data.as_mut_ptr() as *mut u8,
            self.chunk_len * AMPLITUDE_BYTES,
            self.chunk_offset(chunk),
        )?;
        Ok(data)
    }

    fn store(&self, chunk: usize, mut data: Vec<Complex64>, dirty: bool) -> Result<()> {
        if dirty {
            let len = data.len().min(self.chunk_len) * AMPLITUDE_BYTES;
            self.transfer(
                true,
                data.as_mut_ptr() as *mut u8,
                len,
                self.chunk_offset(chunk),
            )?;
        }
        Ok(())
    }

    fn medium(&self) -> &'static str {
        "io_uring"
    }
}
