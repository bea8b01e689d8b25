// src/table.rs
use crate::conn::Connection;
use crate::error::{EtudeError, EtudeResult};
use crate::sync::Locker;
use libc::c_int;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Entry {
    conn: Option<Box<Connection>>,
    // Poll round during which `conn` was installed.
    round: u64,
}

type Slot = Locker<Entry>;

/// Connections indexed by descriptor number.
///
/// The kernel hands out the lowest free descriptor, so a flat array sized to
/// the descriptor limit never needs a free list. Each slot has its own lock;
/// with one-shot readiness only one worker ever asks for a given slot at a
/// time, so the lock is uncontended in practice.
///
/// Descriptor numbers are reused as soon as they are closed, so a batch of
/// readiness events can name a number that now belongs to a connection
/// accepted while the batch was being handled. The table counts poll rounds
/// to tell those apart: see [`ConnectionTable::next_round`].
pub struct ConnectionTable {
    slots: Box<[Slot]>,
    round: AtomicU64,
}

impl ConnectionTable {
    /// Allocate every slot once, up front.
    pub fn new(capacity: usize) -> EtudeResult<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Locker::new(Entry::default())?);
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            round: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: c_int) -> Option<&Slot> {
        usize::try_from(fd).ok().and_then(|idx| self.slots.get(idx))
    }

    /// Store `conn` under `fd`. A stale entry left in the slot is dropped.
    ///
    /// On `TableFull` the connection is dropped, which closes it.
    pub fn install(&self, fd: c_int, conn: Connection) -> EtudeResult<()> {
        let slot = self.slot(fd).ok_or(EtudeError::TableFull)?;
        let mut entry = slot.lock()?;
        entry.conn = Some(Box::new(conn));
        entry.round = self.round.load(Ordering::Acquire);
        Ok(())
    }

    /// Start a new poll round and return its number. Call it right before
    /// waiting for events.
    pub fn next_round(&self) -> u64 {
        self.round.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether `fd` holds a connection installed before `round` began.
    ///
    /// An event from the batch of `round` for a connection installed during
    /// that same round was reported for an earlier socket with the same
    /// number and must be ignored.
    pub fn predates(&self, fd: c_int, round: u64) -> EtudeResult<bool> {
        let Some(slot) = self.slot(fd) else {
            return Ok(false);
        };
        let entry = slot.lock()?;
        Ok(entry.conn.is_some() && entry.round < round)
    }

    /// Run `f` on the connection under `fd`, holding the slot lock.
    ///
    /// If `f` leaves the connection closed, the slot is emptied before the
    /// lock is released, so a freshly accepted descriptor with the same
    /// number can never be clobbered. Returns `None` for an empty slot.
    pub fn with<R>(&self, fd: c_int, f: impl FnOnce(&mut Connection) -> R) -> EtudeResult<Option<R>> {
        let Some(slot) = self.slot(fd) else {
            return Ok(None);
        };
        let mut entry = slot.lock()?;
        let Some(conn) = entry.conn.as_mut() else {
            return Ok(None);
        };
        let out = f(conn);
        if !conn.is_open() {
            entry.conn = None;
        }
        Ok(Some(out))
    }

    /// Close and drop the connection under `fd`. Returns whether there was one.
    pub fn evict(&self, fd: c_int) -> EtudeResult<bool> {
        let Some(slot) = self.slot(fd) else {
            return Ok(false);
        };
        let taken = slot.lock()?.conn.take();
        Ok(match taken {
            Some(mut conn) => {
                conn.close(true);
                true
            }
            None => false,
        })
    }

    /// Close every connection still installed.
    pub fn clear(&self) -> EtudeResult<()> {
        for slot in self.slots.iter() {
            drop(slot.lock()?.conn.take());
        }
        Ok(())
    }
}
