//! A small fixed pool of reusable scratch buffers.
//!
//! Hashing and copying stream through these instead of allocating per file. The pool hands
//! out [`ScratchBuf`] guards which return their slot when dropped, so a buffer can never be
//! reused while something still holds it.

use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct ScratchConfig {
    /// Bytes per slot.
    pub slot_size: usize,
    pub slots: usize,
    /// Warn once this many slots are already in use when another is requested.
    pub warn_at: usize,
    /// When every slot is taken, hand out a heap buffer instead of failing.
    pub fallback: bool,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self { slot_size: 128 << 10, slots: 4, warn_at: 3, fallback: true }
    }
}

#[derive(Debug)]
struct PoolState {
    /// `None` while the slot is lent out.
    slots: Vec<Option<Box<[u8]>>>,
    in_use: usize,
    next: usize,
}

#[derive(Debug)]
pub struct ScratchPool {
    config: ScratchConfig,
    state: RefCell<PoolState>,
}

#[derive(Debug)]
enum Backing {
    Slot(usize, Box<[u8]>),
    Heap(Box<[u8]>),
}

/// A buffer borrowed from a [`ScratchPool`].
#[derive(Debug)]
pub struct ScratchBuf<'a> {
    pool: &'a ScratchPool,
    backing: Option<Backing>,
}

impl ScratchPool {
    pub fn new(config: ScratchConfig) -> Self {
        let slots = (0..config.slots).map(|_| Some(vec![0u8; config.slot_size].into_boxed_slice())).collect();
        Self { state: RefCell::new(PoolState { slots, in_use: 0, next: 0 }), config }
    }

    pub fn slot_size(&self) -> usize {
        self.config.slot_size
    }

    pub fn in_use(&self) -> usize {
        self.state.borrow().in_use
    }

    pub fn alloc(&self) -> Result<ScratchBuf<'_>> {
        let mut state = self.state.borrow_mut();
        if state.in_use >= self.config.warn_at {
            warn!("scratch pool pressure: {} of {} slots in use", state.in_use, self.config.slots);
        }

        let count = state.slots.len();
        for i in 0..count {
            let j = (state.next + i) % count;
            if let Some(buf) = state.slots[j].take() {
                state.in_use += 1;
                state.next = (j + 1) % count;
                return Ok(ScratchBuf { pool: self, backing: Some(Backing::Slot(j, buf)) });
            }
        }

        if !self.config.fallback {
            return Err(Error::PoolExhausted(state.in_use));
        }
        warn!("scratch pool exhausted, falling back to a heap buffer");
        Ok(ScratchBuf { pool: self, backing: Some(Backing::Heap(vec![0u8; self.config.slot_size].into_boxed_slice())) })
    }

    fn release(&self, slot: usize, buf: Box<[u8]>) {
        let mut state = self.state.borrow_mut();
        state.slots[slot] = Some(buf);
        state.in_use -= 1;
        state.next = slot;
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(ScratchConfig::default())
    }
}

impl ScratchBuf<'_> {
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Some(Backing::Slot(..)))
    }
}

impl Deref for ScratchBuf<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match &self.backing {
            Some(Backing::Slot(_, buf)) | Some(Backing::Heap(buf)) => &buf[..],
            None => &[],
        }
    }
}

impl DerefMut for ScratchBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Some(Backing::Slot(_, buf)) | Some(Backing::Heap(buf)) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for ScratchBuf<'_> {
    fn drop(&mut self) {
        if let Some(Backing::Slot(slot, buf)) = self.backing.take() {
            self.pool.release(slot, buf);
        }
    }
}
