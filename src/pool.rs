//! Fixed pool of page-aligned buffers with lease semantics.
//!
//! The pool owns one contiguous mapping, heap-backed or shared-memory
//! backed, carved into equally sized buffers separated by padding pages
//! so that concurrent producers and consumers never share a
//! cache-prefetch neighborhood. Buffers are handed out as
//! [`BufferLease`] values; dropping a lease returns the buffer and
//! signals one waiter.
//!
//! # Sharing with a child process
//!
//! A shared-memory pool exports `(fd, base, len)` via
//! [`BufferPool::shared_memory_info`]. Pass the fd and length to the
//! child once (see [`crate::ipc`]); the child maps them with
//! [`SharedPoolMapping::map`] and resolves each transferred lease from
//! its `(offset, len)` span. The parent must keep the lease alive until
//! the child acknowledges it is done with that buffer. The fd grants
//! write access; never hand it to an untrusted peer.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::waitable::{Waitable, WaitableToken, Waiter};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Buffer size used when the caller passes 0.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

struct Mapping {
    base: NonNull<u8>,
    len: usize,
    shm: Option<OwnedFd>,
}

impl Mapping {
    /// Anonymous private mapping for single-process pools.
    fn anonymous(len: usize) -> Result<Self> {
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .inspect_err(|e| tracing::warn!("anonymous mmap of {len} bytes failed: {e}"))?;
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;
        Ok(Self {
            base,
            len,
            shm: None,
        })
    }

    /// Anonymous shared memory via memfd, sealed against shrinking.
    fn shared(len: usize) -> Result<Self> {
        let fd = rustix::fs::memfd_create(
            "aqueduct-pool",
            rustix::fs::MemfdFlags::CLOEXEC | rustix::fs::MemfdFlags::ALLOW_SEALING,
        )
        .inspect_err(|e| tracing::warn!("memfd_create failed: {e}"))?;
        rustix::fs::ftruncate(&fd, len as u64)
            .inspect_err(|e| tracing::warn!("ftruncate to {len} bytes failed: {e}"))?;
        rustix::fs::fcntl_add_seals(&fd, rustix::fs::SealFlags::SHRINK)
            .inspect_err(|e| tracing::warn!("sealing failed: {e}"))?;
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .inspect_err(|e| tracing::warn!("mmap of shared pool failed: {e}"))?;
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;
        Ok(Self {
            base,
            len,
            shm: Some(fd),
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping we own; all buffer views
        // are gone once the pool core drops.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is plain memory; access discipline is enforced by
// the lease protocol above it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

struct PoolCore {
    waitable: Waitable,
    free: Mutex<Vec<Buffer>>,
    mapping: Mapping,
    buffer_count: usize,
    buffer_size: usize,
}

impl PoolCore {
    fn release(&self, mut buffer: Buffer) {
        {
            let mut free = self.free.lock().unwrap();
            buffer.clear();
            free.push(buffer);
        }
        self.waitable.signal_availability();
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        // Leases hold a strong reference to the core, so by the time we
        // get here every one of them has been returned.
        let free = self.free.get_mut().unwrap();
        assert_eq!(
            free.len(),
            self.buffer_count,
            "buffer pool dropped with outstanding leases"
        );
    }
}

/// Export of a shared-memory pool's backing: fd, mapping base, mapping
/// length.
pub struct SharedMemoryInfo<'a> {
    /// File descriptor of the backing memory object.
    pub fd: BorrowedFd<'a>,
    /// Base address of the pool's own mapping.
    pub base: *const u8,
    /// Total length of the mapping.
    pub len: usize,
}

/// A fixed-size pool of page-aligned buffers.
///
/// Cloning yields another handle to the same pool.
///
/// # Example
///
/// ```rust
/// use aqueduct::pool::BufferPool;
///
/// let pool = BufferPool::with_config(4, 64 * 1024, false).unwrap();
/// assert_eq!(pool.buffer_count(), 4);
///
/// let lease = pool.try_get_buffer().expect("pool is full");
/// assert_eq!(lease.capacity(), 64 * 1024);
/// drop(lease); // buffer returns to the pool
/// ```
#[derive(Clone)]
pub struct BufferPool {
    core: Arc<PoolCore>,
}

impl BufferPool {
    /// Heap-backed pool with the default buffer size.
    pub fn new(buffer_count: usize) -> Result<Self> {
        Self::with_config(buffer_count, 0, false)
    }

    /// Create a pool.
    ///
    /// `buffer_size` of 0 selects [`DEFAULT_BUFFER_SIZE`]. With
    /// `use_shm` the backing is an anonymous shared-memory object whose
    /// fd can be exported via [`shared_memory_info`](Self::shared_memory_info).
    pub fn with_config(buffer_count: usize, buffer_size: usize, use_shm: bool) -> Result<Self> {
        if buffer_count == 0 {
            return Err(Error::Precondition("buffer_count must be at least 1".into()));
        }
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };

        let page = rustix::param::page_size();
        let rounded = buffer_size.div_ceil(page) * page;
        // One leading padding page, then per buffer the rounded region
        // plus one trailing padding page.
        let len = rounded
            .checked_add(page)
            .and_then(|per| per.checked_mul(buffer_count))
            .and_then(|v| v.checked_add(page))
            .ok_or_else(|| Error::AllocationFailed("pool size overflows".into()))?;

        let mapping = if use_shm {
            Mapping::shared(len)?
        } else {
            Mapping::anonymous(len)?
        };

        let mut free = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            let offset = page + i * (rounded + page);
            // SAFETY: offset + buffer_size stays inside the mapping by
            // construction of `len`; each region is disjoint.
            let base = unsafe { NonNull::new_unchecked(mapping.base.as_ptr().add(offset)) };
            free.push(unsafe { Buffer::from_raw(base, buffer_size) });
        }

        Ok(Self {
            core: Arc::new(PoolCore {
                waitable: Waitable::new(),
                free: Mutex::new(free),
                mapping,
                buffer_count,
                buffer_size,
            }),
        })
    }

    /// Lease a buffer, or register `waiter` and return `None`.
    ///
    /// On `None` the caller must not call again until the waiter has
    /// been signaled. When several parties are waiting, the order they
    /// are woken in is unspecified.
    pub fn get_buffer(&self, waiter: &Waiter) -> Option<BufferLease> {
        let mut free = self.core.free.lock().unwrap();
        match free.pop() {
            Some(buffer) => Some(BufferLease {
                buffer,
                core: self.core.clone(),
            }),
            None => {
                self.core.waitable.add_waiter(waiter.clone());
                None
            }
        }
    }

    /// Lease a buffer without registering anything on failure.
    pub fn try_get_buffer(&self) -> Option<BufferLease> {
        let mut free = self.core.free.lock().unwrap();
        free.pop().map(|buffer| BufferLease {
            buffer,
            core: self.core.clone(),
        })
    }

    /// Number of buffers the pool was created with.
    pub fn buffer_count(&self) -> usize {
        self.core.buffer_count
    }

    /// Usable capacity of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.core.buffer_size
    }

    /// Number of buffers currently in the free list.
    pub fn free_buffers(&self) -> usize {
        self.core.free.lock().unwrap().len()
    }

    /// True if the pool is backed by exportable shared memory.
    pub fn is_shared(&self) -> bool {
        self.core.mapping.shm.is_some()
    }

    /// Export the shared-memory backing, if any.
    ///
    /// See the module docs for the cross-process lease protocol.
    pub fn shared_memory_info(&self) -> Option<SharedMemoryInfo<'_>> {
        self.core.mapping.shm.as_ref().map(|fd| SharedMemoryInfo {
            fd: fd.as_fd(),
            base: self.core.mapping.base.as_ptr(),
            len: self.core.mapping.len,
        })
    }

    /// Identity token of the pool's waitable.
    pub fn token(&self) -> WaitableToken {
        self.core.waitable.token()
    }

    /// Register a waiter for buffer availability.
    pub fn add_waiter(&self, waiter: Waiter) {
        self.core.waitable.add_waiter(waiter);
    }

    /// Withdraw a waiter. See [`Waitable::remove_waiter`].
    pub fn remove_waiter(&self, waiter: &Waiter) {
        self.core.waitable.remove_waiter(waiter);
    }
}

/// Exclusive handle to one pool buffer.
///
/// Dereferences to [`Buffer`]. Dropping the lease clears the buffer,
/// returns it to the pool and signals one waiter. Move-only.
pub struct BufferLease {
    buffer: Buffer,
    core: Arc<PoolCore>,
}

impl BufferLease {
    /// `(offset_from_base, readable_len)` — the per-lease tuple sent to
    /// a co-operating child process alongside the pool's fd.
    pub fn shared_span(&self) -> (u64, usize) {
        let offset = self.buffer.base().as_ptr() as usize - self.core.mapping.base.as_ptr() as usize;
        (offset as u64, self.buffer.len())
    }
}

impl Deref for BufferLease {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        // SAFETY: same region the lease held; this view replaces the
        // one being dismantled, so exclusivity is preserved.
        let buffer = unsafe { Buffer::from_raw(self.buffer.base(), self.buffer.capacity()) };
        self.core.release(buffer);
    }
}

/// Child-process view of an exported pool mapping.
///
/// Maps the fd received from the pool-owning process and resolves
/// transferred `(offset, len)` spans to slices.
pub struct SharedPoolMapping {
    base: NonNull<u8>,
    len: usize,
}

impl SharedPoolMapping {
    /// Map `len` bytes of the pool fd received from the parent.
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Precondition("mapping length must be nonzero".into()));
        }
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }?;
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;
        Ok(Self { base, len })
    }

    /// Resolve a transferred lease span. Returns `None` if the span
    /// falls outside the mapping.
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let offset = usize::try_from(offset).ok()?;
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: bounds-checked above; the parent holds the lease, so
        // nobody writes the span while the child reads it.
        Some(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }

    /// Total length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedPoolMapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping this value owns.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: plain shared memory, read through bounds-checked slices.
unsafe impl Send for SharedPoolMapping {}
unsafe impl Sync for SharedPoolMapping {}
