//! Indexed thread-local variables with removal callbacks.
//!
//! Every [`FastThreadLocal`] takes a process-wide index on creation. Each
//! thread keeps one vector of slots addressed by that index, so a lookup is a
//! bounds check and a downcast. A value may carry a removal callback that runs
//! exactly once, either when [`FastThreadLocal::remove`] is called or when the
//! owning thread exits.
//!
//! Indices of dropped variables are handed out again, so a thread's slot
//! vector never grows past the largest number of variables alive at once.
//! Each variable also carries a generation that is never reused. A value left
//! behind by a dropped variable on another thread is not visible to the
//! variable that reuses its index; it is released, callback included, when
//! that slot is next written or the thread exits.
//!
//! Callbacks run after the slot has been taken out of the vector, so they may
//! freely touch other thread-local variables. During thread teardown the slot
//! vector is already gone and such lookups return `None`.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);
static FREE_INDICES: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

thread_local! {
    static SLOTS: RefCell<SlotMap> = const { RefCell::new(SlotMap { slots: Vec::new() }) };
}

type RemovalFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Identifies one variable: its slot index and its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotKey {
    index: usize,
    generation: u64,
}

impl SlotKey {
    fn acquire() -> Self {
        let index = FREE_INDICES
            .lock()
            .pop()
            .unwrap_or_else(|| NEXT_INDEX.fetch_add(1, Ordering::Relaxed));
        Self {
            index,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }
}

trait Slot {
    fn generation(&self) -> u64;
    fn value(&self) -> &dyn Any;
    fn remove(self: Box<Self>);
}

struct Entry<T> {
    generation: u64,
    value: T,
    on_removal: Option<RemovalFn<T>>,
}

impl<T: 'static> Slot for Entry<T> {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn value(&self) -> &dyn Any {
        &self.value
    }

    fn remove(self: Box<Self>) {
        let Entry { value, on_removal, .. } = *self;
        if let Some(callback) = on_removal {
            callback(value);
        }
    }
}

struct SlotMap {
    slots: Vec<Option<Box<dyn Slot>>>,
}

impl Drop for SlotMap {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        for slot in slots.into_iter().flatten() {
            slot.remove();
        }
    }
}

/// Reads the value stored for `key` on the current thread.
pub(crate) fn lookup<T: Clone + 'static>(key: SlotKey) -> Option<T> {
    SLOTS
        .try_with(|map| {
            let map = map.try_borrow().ok()?;
            let slot = map.slots.get(key.index)?.as_ref()?;
            if slot.generation() != key.generation {
                return None;
            }
            slot.value().downcast_ref::<T>().cloned()
        })
        .ok()
        .flatten()
}

fn take(key: SlotKey) -> Option<Box<dyn Slot>> {
    SLOTS
        .try_with(|map| {
            let mut map = map.try_borrow_mut().ok()?;
            let slot = map.slots.get_mut(key.index)?;
            if slot.as_ref()?.generation() != key.generation {
                return None;
            }
            slot.take()
        })
        .ok()
        .flatten()
}

/// A thread-local variable addressed by a fixed index.
///
/// Values are cloned out on access, so `T` is usually a cheap handle such as
/// an `Rc` or `Arc`.
///
/// # Example
///
/// ```rust
/// use ruapc_bytepool::FastThreadLocal;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let removed = Arc::new(AtomicUsize::new(0));
/// let counter = removed.clone();
/// let local = FastThreadLocal::with_removal(
///     || 7u32,
///     move |_| {
///         counter.fetch_add(1, Ordering::SeqCst);
///     },
/// );
///
/// assert_eq!(local.get(), Some(7));
/// local.remove();
/// assert_eq!(removed.load(Ordering::SeqCst), 1);
/// ```
pub struct FastThreadLocal<T: 'static> {
    key: SlotKey,
    init: Box<dyn Fn(SlotKey) -> T + Send + Sync>,
    on_removal: Option<RemovalFn<T>>,
}

impl<T: Clone + 'static> FastThreadLocal<T> {
    /// Creates a variable initialized by `init` on first access per thread.
    pub fn new(init: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            key: SlotKey::acquire(),
            init: Box::new(move |_| init()),
            on_removal: None,
        }
    }

    /// Variant whose initializer is told the key of the slot it fills.
    pub(crate) fn indexed(
        init: impl Fn(SlotKey) -> T + Send + Sync + 'static,
        on_removal: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: SlotKey::acquire(),
            init: Box::new(init),
            on_removal: Some(Arc::new(on_removal)),
        }
    }

    /// Like [`new`](Self::new), with a callback invoked once for every value
    /// that is removed, explicitly or by thread exit.
    pub fn with_removal(
        init: impl Fn() -> T + Send + Sync + 'static,
        on_removal: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self::indexed(move |_| init(), on_removal)
    }

    /// Slot index shared by all threads.
    ///
    /// The index of a dropped variable may be handed to a new one.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.key.index
    }

    /// Returns the current thread's value, initializing it on first access.
    ///
    /// Returns `None` only while the thread's storage is being torn down.
    pub fn get(&self) -> Option<T> {
        if let Some(value) = self.get_if_exists() {
            return Some(value);
        }
        let value = (self.init)(self.key);
        if self.set(value.clone()) {
            Some(value)
        } else {
            None
        }
    }

    /// Returns the current thread's value without initializing it.
    #[must_use]
    pub fn get_if_exists(&self) -> Option<T> {
        lookup(self.key)
    }

    /// Returns `true` if the current thread holds a value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.get_if_exists().is_some()
    }

    /// Stores `value` for the current thread, replacing any previous value
    /// without running the removal callback for it.
    ///
    /// A value left in the slot by a dropped variable is released with its
    /// own callback.
    ///
    /// Returns `false` if the thread's storage is no longer available.
    pub fn set(&self, value: T) -> bool {
        let SlotKey { index, generation } = self.key;
        let entry: Box<dyn Slot> = Box::new(Entry {
            generation,
            value,
            on_removal: self.on_removal.clone(),
        });
        let replaced = SLOTS.try_with(|map| {
            let mut map = map.try_borrow_mut().ok()?;
            if map.slots.len() <= index {
                map.slots.resize_with(index + 1, || None);
            }
            Some(map.slots[index].replace(entry))
        });
        // Released outside the borrow.
        match replaced {
            Ok(Some(Some(previous))) if previous.generation() != generation => {
                previous.remove();
                true
            }
            Ok(Some(_)) => true,
            _ => false,
        }
    }
}

impl<T: 'static> FastThreadLocal<T> {
    /// Removes the current thread's value and runs the removal callback.
    pub fn remove(&self) {
        if let Some(slot) = take(self.key) {
            slot.remove();
        }
    }
}

impl<T: 'static> Drop for FastThreadLocal<T> {
    fn drop(&mut self) {
        self.remove();
        FREE_INDICES.lock().push(self.key.index);
    }
}

impl<T: 'static> fmt::Debug for FastThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastThreadLocal")
            .field("index", &self.key.index)
            .field("generation", &self.key.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::Mutex;

    #[test]
    fn test_initializer_runs_once_per_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let local = FastThreadLocal::new(move || counter.fetch_add(1, Ordering::SeqCst));

        assert!(!local.is_set());
        assert_eq!(local.get(), Some(0));
        assert_eq!(local.get(), Some(0));
        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(local.get(), Some(1)));
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(local.get(), Some(0));
    }

    #[test]
    fn test_set_and_get_if_exists() {
        let local = FastThreadLocal::new(|| String::from("init"));
        assert_eq!(local.get_if_exists(), None);
        assert!(local.set(String::from("set")));
        assert_eq!(local.get_if_exists().as_deref(), Some("set"));
        assert_eq!(local.get().as_deref(), Some("set"));
    }

    #[test]
    fn test_remove_runs_callback_once() {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let local = FastThreadLocal::with_removal(|| 5, move |v| sink.lock().unwrap().push(v));

        local.get();
        local.remove();
        local.remove();
        assert_eq!(*removed.lock().unwrap(), vec![5]);
        assert!(!local.is_set());

        // A fresh value is created after removal.
        assert_eq!(local.get(), Some(5));
        drop(local);
        assert_eq!(*removed.lock().unwrap(), vec![5, 5]);
    }

    #[test]
    fn test_thread_exit_runs_callback() {
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        let local = Arc::new(FastThreadLocal::with_removal(
            || 1u8,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let local = local.clone();
                std::thread::spawn(move || {
                    local.get();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(removed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_callback_may_touch_other_locals() {
        let other = Arc::new(FastThreadLocal::new(|| 3i32));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (observed, sink) = (other.clone(), seen.clone());
        let local = Arc::new(FastThreadLocal::with_removal(
            || 0i32,
            move |_| sink.lock().unwrap().push(observed.get()),
        ));

        local.get();
        local.remove();

        let remote = local.clone();
        std::thread::spawn(move || {
            remote.get();
        })
        .join()
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Some(3));
        // During thread teardown the storage is gone.
        assert_eq!(seen[1], None);
    }

    #[test]
    fn test_dropped_indices_are_reused() {
        let start = NEXT_INDEX.load(Ordering::Relaxed);
        for i in 0..10_000u32 {
            let local = FastThreadLocal::new(move || i);
            assert_eq!(local.get(), Some(i));
        }
        // Other tests create variables concurrently, but far fewer than this.
        assert!(NEXT_INDEX.load(Ordering::Relaxed) - start < 1_000);
    }

    #[test]
    fn test_reused_index_hides_stale_value() {
        let local = FastThreadLocal::new(|| 1u32);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        // Left behind by an earlier variable that held the same index.
        let stale: Box<dyn Slot> = Box::new(Entry {
            generation: u64::MAX,
            value: 99u32,
            on_removal: Some(Arc::new(move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        });
        SLOTS.with(|map| {
            let mut map = map.borrow_mut();
            let index = local.index();
            if map.slots.len() <= index {
                map.slots.resize_with(index + 1, || None);
            }
            map.slots[index] = Some(stale);
        });

        assert_eq!(local.get_if_exists(), None);
        local.remove();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert_eq!(local.get(), Some(1));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(local.get(), Some(1));
    }

    #[test]
    fn test_new_local_never_sees_dropped_value() {
        type Local = Arc<FastThreadLocal<u32>>;
        let (to_worker, requests) = std::sync::mpsc::channel::<Local>();
        let (to_main, replies) = std::sync::mpsc::channel::<(Option<u32>, Local)>();
        let worker = std::thread::spawn(move || {
            for local in requests {
                to_main.send((local.get(), local)).unwrap();
            }
        });

        for i in 0..32u32 {
            let local = Arc::new(FastThreadLocal::new(move || i));
            to_worker.send(local).unwrap();
            let (seen, local) = replies.recv().unwrap();
            assert_eq!(seen, Some(i));
            // Dropped here while the worker still holds a value for it.
            drop(local);
        }
        drop(to_worker);
        worker.join().unwrap();
    }

    #[test]
    fn test_rc_values_stay_on_thread() {
        let local = FastThreadLocal::new(|| Rc::new(std::cell::Cell::new(0)));
        let a = local.get().unwrap();
        a.set(9);
        assert_eq!(local.get().unwrap().get(), 9);
        assert!(Rc::ptr_eq(&a, &local.get().unwrap()));
    }
}
