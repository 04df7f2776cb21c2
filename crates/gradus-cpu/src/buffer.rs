use std::fmt;
use std::ops::{Deref, Range};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use gradus_core::backend::BackendBuffer;
use gradus_core::error::{Error, Result};
use gradus_core::WithDType;

// CpuBuffer: a window into shared host memory
//
//   memory  Arc<RwLock<Vec<E>>>   the allocation, shared by views
//   offset  usize                 first element of this window
//   len     usize                 number of elements in the window
//
// Views (`advanced`) share `memory` and differ only in the window.
//
// Kernels read their inputs in place under a read lock and write their
// output under the write lock. An input living in an allocation the kernel
// also locks (the output's, or another input's) is copied up front instead,
// since the locks are not reentrant.

/// Read access to a kernel input.
pub(crate) enum Input<'a, E> {
    /// The window itself, under a read lock on its allocation.
    Locked(RwLockReadGuard<'a, Vec<E>>, Range<usize>),
    /// A copy, taken because the allocation is locked elsewhere.
    Copied(Vec<E>),
}

impl<E> Deref for Input<'_, E> {
    type Target = [E];

    fn deref(&self) -> &[E] {
        match self {
            Input::Locked(guard, range) => &guard[range.clone()],
            Input::Copied(data) => data,
        }
    }
}

/// Host memory buffer used by the CPU backend.
#[derive(Clone)]
pub struct CpuBuffer<E: WithDType> {
    memory: Arc<RwLock<Vec<E>>>,
    offset: usize,
    len: usize,
}

impl<E: WithDType> fmt::Debug for CpuBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CpuBuffer<{}>(offset={}, len={})",
            E::DTYPE,
            self.offset,
            self.len
        )
    }
}

impl<E: WithDType> BackendBuffer<E> for CpuBuffer<E> {
    fn len(&self) -> usize {
        self.len
    }
}

impl<E: WithDType> CpuBuffer<E> {
    /// A zero-initialised buffer of `len` elements.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![E::default(); len])
    }

    pub fn from_vec(data: Vec<E>) -> Self {
        let len = data.len();
        CpuBuffer {
            memory: Arc::new(RwLock::new(data)),
            offset: 0,
            len,
        }
    }

    /// A window starting `by` elements into this one.
    pub fn advanced(&self, by: usize) -> Result<Self> {
        self.window(by, self.len.saturating_sub(by))
    }

    /// A window of `len` elements starting `offset` elements into this one.
    pub fn window(&self, offset: usize, len: usize) -> Result<Self> {
        if offset + len > self.len {
            return Err(Error::msg(format!(
                "window {}..{} outside a buffer of {} elements",
                offset,
                offset + len,
                self.len
            )));
        }
        Ok(CpuBuffer {
            memory: Arc::clone(&self.memory),
            offset: self.offset + offset,
            len,
        })
    }

    /// Run `f` on the elements of this window.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[E]) -> R) -> Result<R> {
        let guard = self.memory.read().map_err(|_| Error::LockPoisoned)?;
        let window = guard
            .get(self.offset..self.offset + self.len)
            .ok_or_else(|| Error::msg("buffer window outside its allocation"))?;
        Ok(f(window))
    }

    /// Run `f` on the elements of this window, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [E]) -> R) -> Result<R> {
        let mut guard = self.memory.write().map_err(|_| Error::LockPoisoned)?;
        let window = guard
            .get_mut(self.offset..self.offset + self.len)
            .ok_or_else(|| Error::msg("buffer window outside its allocation"))?;
        Ok(f(window))
    }

    /// Copy of the first `count` elements.
    pub fn prefix(&self, count: usize) -> Result<Vec<E>> {
        if count > self.len {
            return Err(Error::msg(format!(
                "cannot read {} elements from a buffer of {}",
                count, self.len
            )));
        }
        self.with_slice(|s| s[..count].to_vec())
    }

    /// Identity of the allocation behind this window. Views of one buffer
    /// share it.
    pub(crate) fn memory_id(&self) -> usize {
        Arc::as_ptr(&self.memory) as *const () as usize
    }

    /// The first `count` elements, read in place. Copied instead when the
    /// allocation is one of `locked`.
    pub(crate) fn input(&self, count: usize, locked: &[usize]) -> Result<Input<'_, E>> {
        if count > self.len {
            return Err(Error::msg(format!(
                "cannot read {} elements from a buffer of {}",
                count, self.len
            )));
        }
        if locked.contains(&self.memory_id()) {
            return Ok(Input::Copied(self.prefix(count)?));
        }
        let guard = self.memory.read().map_err(|_| Error::LockPoisoned)?;
        let range = self.offset..self.offset + count;
        if range.end > guard.len() {
            return Err(Error::msg("buffer window outside its allocation"));
        }
        Ok(Input::Locked(guard, range))
    }

    /// Copy of the whole window.
    pub fn to_vec(&self) -> Result<Vec<E>> {
        self.prefix(self.len)
    }

    /// Drop the allocation's contents.
    pub(crate) fn release(&self) {
        log::trace!("cpu: free {} elements of {}", self.len, E::DTYPE);
        if let Ok(mut guard) = self.memory.write() {
            guard.clear();
            guard.shrink_to_fit();
        }
    }
}
