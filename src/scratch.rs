//! Reusable scratch storage.
//!
//! Message handling wants a byte buffer and an index vector at almost every
//! step; borrowing them from a pool keeps the per-message allocation churn
//! down. A checkout is a guard that hands the storage back on drop, cleared
//! but with its capacity kept.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

#[derive(Default)]
struct Inner {
    bufs: Vec<Vec<u8>>,
    indexes: Vec<Vec<u64>>,
}

/// A cloneable handle to the daemon's scratch pool.
#[derive(Clone, Default)]
pub struct ScratchPool {
    inner: Rc<RefCell<Inner>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a byte buffer; at most one caller holds any given buffer.
    pub fn buf(&self) -> ScratchBuf {
        let buf = self.inner.borrow_mut().bufs.pop().unwrap_or_default();
        ScratchBuf {
            pool: Rc::clone(&self.inner),
            buf: Some(buf),
        }
    }

    /// Borrows an index vector.
    pub fn indexes(&self) -> ScratchIndexes {
        let idx = self.inner.borrow_mut().indexes.pop().unwrap_or_default();
        ScratchIndexes {
            pool: Rc::clone(&self.inner),
            idx: Some(idx),
        }
    }
}

pub struct ScratchBuf {
    pool: Rc<RefCell<Inner>>,
    buf: Option<Vec<u8>>,
}

impl Deref for ScratchBuf {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("scratch buffer present until drop")
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("scratch buffer present until drop")
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.borrow_mut().bufs.push(buf);
        }
    }
}

pub struct ScratchIndexes {
    pool: Rc<RefCell<Inner>>,
    idx: Option<Vec<u64>>,
}

impl Deref for ScratchIndexes {
    type Target = Vec<u64>;
    fn deref(&self) -> &Vec<u64> {
        self.idx.as_ref().expect("scratch indexes present until drop")
    }
}

impl DerefMut for ScratchIndexes {
    fn deref_mut(&mut self) -> &mut Vec<u64> {
        self.idx.as_mut().expect("scratch indexes present until drop")
    }
}

impl Drop for ScratchIndexes {
    fn drop(&mut self) {
        if let Some(mut idx) = self.idx.take() {
            idx.clear();
            self.pool.borrow_mut().indexes.push(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_survives_checkout() {
        let pool = ScratchPool::new();
        let ptr;
        {
            let mut b = pool.buf();
            b.extend_from_slice(&[0u8; 4096]);
            ptr = b.as_ptr();
        }
        let b = pool.buf();
        assert!(b.is_empty());
        assert!(b.capacity() >= 4096);
        assert_eq!(b.as_ptr(), ptr);
    }

    #[test]
    fn test_two_holders_get_distinct_buffers() {
        let pool = ScratchPool::new();
        let mut a = pool.buf();
        let mut b = pool.buf();
        a.push(1);
        b.push(2);
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }
}
