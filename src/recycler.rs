//! Thread-confined object pool with a cross-thread return queue.
//!
//! Each thread owns a [`LocalPool`] holding a small LIFO batch of released
//! objects. Objects released on their owner thread go straight back into the
//! batch; objects released elsewhere travel through a bounded `mpsc` channel
//! that the owner drains when its batch runs dry. Only every `ratio`-th miss
//! mints a pooled object. The others get a no-op wrapper, so sustained
//! pressure cannot grow a pool past its cap.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::fast_thread_local::{self, FastThreadLocal, SlotKey};

/// Default number of objects a thread may keep.
pub const DEFAULT_MAX_CAPACITY_PER_THREAD: usize = 4096;
/// Default minting ratio: one pooled object per this many misses.
pub const DEFAULT_RATIO: u32 = 8;
/// Size of the local batch and of each drain from the return queue.
pub const BATCH_SIZE: usize = 32;

const STATE_CLAIMED: u8 = 0;
const STATE_AVAILABLE: u8 = 1;

/// Shared link between a local pool and the objects it minted.
struct PoolLink<T> {
    owner: ThreadId,
    alive: AtomicBool,
    sender: mpsc::Sender<Box<Slot<T>>>,
    key: SlotKey,
}

struct Slot<T> {
    value: T,
    state: AtomicU8,
    link: Option<Arc<PoolLink<T>>>,
}

impl<T> Slot<T> {
    fn to_claimed(&self) -> Result<()> {
        if self.state.swap(STATE_CLAIMED, Ordering::AcqRel) == STATE_AVAILABLE {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidData,
                "claimed an object that is not available",
            ))
        }
    }

    fn to_available(&self) -> Result<()> {
        if self.state.swap(STATE_AVAILABLE, Ordering::AcqRel) == STATE_CLAIMED {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidData,
                "object has been recycled already",
            ))
        }
    }
}

struct LocalPool<T> {
    batch: RefCell<Vec<Box<Slot<T>>>>,
    receiver: RefCell<Option<mpsc::Receiver<Box<Slot<T>>>>>,
    ratio: u32,
    ratio_counter: Cell<u32>,
    link: Arc<PoolLink<T>>,
}

impl<T> LocalPool<T> {
    fn new(max_capacity: usize, ratio: u32, key: SlotKey) -> Self {
        let (sender, receiver) = mpsc::channel(max_capacity);
        Self {
            batch: RefCell::new(Vec::with_capacity(BATCH_SIZE)),
            receiver: RefCell::new(Some(receiver)),
            ratio,
            // Starts full so the first miss mints a pooled object.
            ratio_counter: Cell::new(ratio),
            link: Arc::new(PoolLink {
                owner: thread::current().id(),
                alive: AtomicBool::new(true),
                sender,
                key,
            }),
        }
    }

    fn claim(&self) -> Option<Box<Slot<T>>> {
        let mut batch = self.batch.borrow_mut();
        if batch.is_empty() {
            let mut receiver = self.receiver.borrow_mut();
            let receiver = receiver.as_mut()?;
            while batch.len() < BATCH_SIZE {
                match receiver.try_recv() {
                    Ok(slot) => batch.push(slot),
                    Err(_) => break,
                }
            }
        }
        while let Some(slot) = batch.pop() {
            match slot.to_claimed() {
                Ok(()) => return Some(slot),
                Err(e) => log::error!("discarding pooled object: {e}"),
            }
        }
        None
    }

    fn should_mint(&self) -> bool {
        let counter = self.ratio_counter.get() + 1;
        if counter >= self.ratio {
            self.ratio_counter.set(0);
            true
        } else {
            self.ratio_counter.set(counter);
            false
        }
    }

    /// Pushes into the local batch, handing the slot back if it is full.
    fn push(&self, slot: Box<Slot<T>>) -> std::result::Result<(), Box<Slot<T>>> {
        let mut batch = self.batch.borrow_mut();
        if batch.len() < BATCH_SIZE {
            batch.push(slot);
            Ok(())
        } else {
            Err(slot)
        }
    }

    fn detach(&self) {
        self.link.alive.store(false, Ordering::Release);
        let receiver = self.receiver.borrow_mut().take();
        let batch = std::mem::take(&mut *self.batch.borrow_mut());
        log::debug!(
            "detaching recycler pool of {:?} with {} local objects",
            self.link.owner,
            batch.len()
        );
        drop(batch);
        drop(receiver);
    }
}

fn release<T: Send + 'static>(slot: Box<Slot<T>>) -> Result<()> {
    slot.to_available()?;
    let Some(link) = slot.link.clone() else {
        return Ok(());
    };

    let mut slot = slot;
    if link.owner == thread::current().id() {
        if let Some(pool) = fast_thread_local::lookup::<Rc<LocalPool<T>>>(link.key) {
            if Arc::ptr_eq(&pool.link, &link) {
                match pool.push(slot) {
                    Ok(()) => return Ok(()),
                    Err(back) => slot = back,
                }
            }
        }
    }

    if !link.alive.load(Ordering::Acquire) {
        return Ok(());
    }
    match link.sender.try_send(slot) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => log::trace!("recycler return queue is full"),
        Err(TrySendError::Closed(_)) => link.alive.store(false, Ordering::Release),
    }
    Ok(())
}

/// A generic object pool.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::Recycler;
///
/// let recycler = Recycler::new(|| Vec::<u8>::with_capacity(64));
/// let mut v = recycler.get();
/// v.push(1);
/// v.clear();
/// v.recycle().unwrap();
/// ```
pub struct Recycler<T: Send + 'static> {
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    max_capacity_per_thread: usize,
    local: FastThreadLocal<Rc<LocalPool<T>>>,
}

impl<T: Send + 'static> Recycler<T> {
    /// Creates a recycler with the default limits.
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_limits(DEFAULT_MAX_CAPACITY_PER_THREAD, DEFAULT_RATIO, factory)
    }

    /// Creates a recycler keeping at most `max_capacity_per_thread` queued
    /// objects per thread and minting one pooled object per `ratio` misses.
    ///
    /// A capacity of zero disables pooling.
    pub fn with_limits(
        max_capacity_per_thread: usize,
        ratio: u32,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let capacity = max_capacity_per_thread.max(1);
        let ratio = ratio.max(1);
        Self {
            factory: Arc::new(factory),
            max_capacity_per_thread,
            local: FastThreadLocal::indexed(
                move |key| Rc::new(LocalPool::new(capacity, ratio, key)),
                |pool: Rc<LocalPool<T>>| pool.detach(),
            ),
        }
    }

    /// Takes an object from the current thread's pool, or creates one.
    pub fn get(&self) -> Recycled<T> {
        if self.max_capacity_per_thread == 0 {
            return Recycled::noop((self.factory)());
        }
        let Some(pool) = self.local.get() else {
            return Recycled::noop((self.factory)());
        };
        if let Some(slot) = pool.claim() {
            return Recycled { slot: Some(slot) };
        }
        if pool.should_mint() {
            Recycled {
                slot: Some(Box::new(Slot {
                    value: (self.factory)(),
                    state: AtomicU8::new(STATE_CLAIMED),
                    link: Some(pool.link.clone()),
                })),
            }
        } else {
            Recycled::noop((self.factory)())
        }
    }

    /// Objects waiting in the current thread's local batch.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local
            .get_if_exists()
            .map_or(0, |pool| pool.batch.borrow().len())
    }
}

impl<T: Send + 'static> fmt::Debug for Recycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recycler")
            .field("max_capacity_per_thread", &self.max_capacity_per_thread)
            .finish_non_exhaustive()
    }
}

/// An object claimed from a [`Recycler`], released when dropped.
pub struct Recycled<T: Send + 'static> {
    slot: Option<Box<Slot<T>>>,
}

impl<T: Send + 'static> Recycled<T> {
    fn noop(value: T) -> Self {
        Self {
            slot: Some(Box::new(Slot {
                value,
                state: AtomicU8::new(STATE_CLAIMED),
                link: None,
            })),
        }
    }

    /// Returns `true` if this object returns to a pool on release.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.link.is_some())
    }

    /// Releases the object, reporting invalid state transitions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the object was already released.
    pub fn recycle(mut self) -> Result<()> {
        match self.slot.take() {
            Some(slot) => release(slot),
            None => Ok(()),
        }
    }

    fn slot(&self) -> &Slot<T> {
        match &self.slot {
            Some(slot) => slot,
            None => unreachable!("recycled object accessed after release"),
        }
    }

    fn slot_mut(&mut self) -> &mut Slot<T> {
        match &mut self.slot {
            Some(slot) => slot,
            None => unreachable!("recycled object accessed after release"),
        }
    }
}

impl<T: Send + 'static> Deref for Recycled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot().value
    }
}

impl<T: Send + 'static> DerefMut for Recycled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot_mut().value
    }
}

impl<T: Send + 'static> Drop for Recycled<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = release(slot) {
                log::error!("failed to recycle object: {e}");
            }
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Recycled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recycled")
            .field("value", &**self)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
