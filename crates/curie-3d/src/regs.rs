//! Temporary-register pool
//!
//! Tracks which hardware temporaries are live during one compile. IR-declared
//! temporaries are pinned for the whole program; scratch registers used while
//! lowering a single source instruction are acquired through a [`Scratch`]
//! scope and handed back when it drops.

use std::cell::Cell;

use curie_core::TranslationError;

/// Pool of hardware temporary registers for one compile
#[derive(Debug)]
pub struct TempPool {
    live: Cell<u32>,
    limit: u32,
}

impl TempPool {
    pub fn new(limit: u32) -> Self {
        debug_assert!(limit <= 32);
        Self {
            live: Cell::new(0),
            limit,
        }
    }

    /// Acquire a register for the lifetime of the program (IR-declared temps)
    pub fn pin(&self) -> Result<u8, TranslationError> {
        self.acquire()
    }

    /// Open a scratch scope; registers acquired through it are released when
    /// the scope drops
    pub fn scope(&self) -> Scratch<'_> {
        Scratch {
            pool: self,
            acquired: Cell::new(0),
        }
    }

    pub fn live_count(&self) -> u32 {
        self.live.get().count_ones()
    }

    fn acquire(&self) -> Result<u8, TranslationError> {
        let live = self.live.get();
        let idx = (!live).trailing_zeros();
        if idx >= self.limit {
            return Err(TranslationError::OutOfTemporaries { limit: self.limit });
        }
        self.live.set(live | (1 << idx));
        Ok(idx as u8)
    }

    fn release(&self, mask: u32) {
        self.live.set(self.live.get() & !mask);
    }
}

/// Scratch scope: scoped acquisition of temporaries, released on drop
#[derive(Debug)]
pub struct Scratch<'a> {
    pool: &'a TempPool,
    acquired: Cell<u32>,
}

impl Scratch<'_> {
    /// Acquire a scratch register inside this scope
    pub fn alloc(&self) -> Result<u8, TranslationError> {
        let idx = self.pool.acquire()?;
        self.acquired.set(self.acquired.get() | (1 << idx));
        Ok(idx)
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.pool.release(self.acquired.get());
    }
}
