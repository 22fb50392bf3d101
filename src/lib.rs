//! WeakTable: a concurrent weak-keyed table with lock-free reads and a single writer lock.
//! Keys are held through `Weak`, so registering a value never keeps a subscriber alive; the
//! value stays owned by the table and is only reachable while its key still resolves.

use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Smallest container capacity; every capacity is a power of two at least this large
pub const MIN_CAPACITY: usize = 8;

/// Largest container capacity. Capacity hints above it are clamped, and a full container at
/// this capacity with nothing to compact reports [`TableError::CapacityOverflow`].
pub const MAX_CAPACITY: usize = 1 << (usize::BITS - 6);

/// Terminates a bucket chain and marks an empty bucket
const END: usize = usize::MAX;

/// Cached hash of a removed entry. Live hashes always have the top bit clear.
const ERASED: u64 = u64::MAX;

const HASH_MASK: u64 = !(1 << 63);

// ================================================================================================
// ERRORS
// ================================================================================================

/// Errors reported by write operations on a [`WeakTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// A previous write was interrupted half way; the table can no longer be mutated.
    Corrupted,
    /// The container is full at [`MAX_CAPACITY`] and holds nothing that could be compacted.
    CapacityOverflow { capacity: usize },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted => write!(f, "the weak table is in a corrupted state"),
            Self::CapacityOverflow { capacity } => {
                write!(f, "cannot grow weak table beyond capacity {capacity}")
            }
        }
    }
}

impl std::error::Error for TableError {}

pub type Result<T> = std::result::Result<T, TableError>;

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

/// Weak key paired with a strong value. The value is only handed out after the key resolves.
///
/// A handle is shared by pointer between a container and the containers that replace it;
/// exactly one of them releases it (see `Container::drop`).
struct DependentHandle<K: ?Sized, V> {
    key: Weak<K>,
    value: V,
    cleared: AtomicBool,
}

/// One slot of a container's entry array
struct Entry<K: ?Sized, V> {
    hash: AtomicU64, // ERASED once removed
    handle: AtomicPtr<DependentHandle<K, V>>,
    next: AtomicUsize, // next entry in the same bucket, END if last
}

impl<K: ?Sized, V> Default for Entry<K, V> {
    fn default() -> Self {
        Self {
            hash: AtomicU64::new(0),
            handle: AtomicPtr::new(std::ptr::null_mut()),
            next: AtomicUsize::new(END),
        }
    }
}

/// Fixed-capacity storage. Readers never see entries move: growth builds a new container and
/// publishes it in one store, appends write the entry before linking it into its bucket.
struct Container<K: ?Sized, V> {
    buckets: Box<[AtomicUsize]>,
    entries: Box<[Entry<K, V>]>,
    first_free: AtomicUsize,
    // Set once, when a successor took over the handles this container still links
    owned_by_newer: AtomicBool,
    // Raised for the duration of a write; stays raised if that write unwound
    invalid: AtomicBool,
    _marker: PhantomData<Box<DependentHandle<K, V>>>,
}

// ================================================================================================
// MAIN TABLE STRUCTURE
// ================================================================================================

/// Concurrent table keyed by the identity of `Arc<K>` allocations, holding keys weakly.
///
/// * Reads (`get`, `contains_key`) take no lock and never block.
/// * Writes (`try_add`, `remove`, `get_or_add_with`, `clear`, `purge_expired`) are serialized
///   by one mutex.
/// * `iter` holds that mutex until the iterator is dropped.
///
/// A key expires when its last `Arc` is dropped. Expired entries stop matching immediately;
/// their values are released the next time the container is compacted (on growth, on
/// `purge_expired`, on `clear`) or when the table itself is dropped.
///
/// Replaced containers are released by whichever thread next pins the epoch, which may be any
/// caller of any table. Every operation pins before it takes the writer lock, so a value's
/// `Drop` may write to its own table, unless it runs on a thread that holds an open `iter`.
pub struct WeakTable<K: ?Sized, V, S = RandomState> {
    lock: Mutex<()>,
    container: Atomic<Container<K, V>>,
    initial_capacity: usize,
    hasher: S,
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K, V> WeakTable<K, V, RandomState>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a new table with the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a new table whose first container holds at least `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Create a new table using the provided hasher for key addresses.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Create a new table with the given capacity hint and hasher.
    ///
    /// The capacity is rounded up to a power of two no smaller than [`MIN_CAPACITY`] and no
    /// larger than [`MAX_CAPACITY`]. `clear` returns the table to this capacity.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let initial_capacity = calc_capacity(capacity);
        Self {
            lock: Mutex::new(()),
            container: Atomic::new(Container::new(initial_capacity)),
            initial_capacity,
            hasher,
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Returns a clone of the value registered for `key`, if the key is present.
    ///
    /// Lock-free. `key` is matched by address, so it must be the contents of the `Arc` that was
    /// passed to `try_add` (a `&Arc<K>` coerces).
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let addr = key_address(key);
        let hash = self.hash_of(addr);
        let guard = epoch::pin();
        self.current(&guard).get_value(addr, hash).cloned()
    }

    /// Check whether `key` is present. Lock-free.
    pub fn contains_key(&self, key: &K) -> bool {
        let addr = key_address(key);
        let hash = self.hash_of(addr);
        let guard = epoch::pin();
        self.current(&guard).find_entry(addr, hash).is_some()
    }

    /// Registers `value` for `key` unless the key is already present.
    ///
    /// Returns `Ok(false)` and leaves the existing value in place when the key is present.
    pub fn try_add(&self, key: &Arc<K>, value: V) -> Result<bool> {
        let addr = key_address(&**key);
        let hash = self.hash_of(addr);

        let guard = epoch::pin();
        let _lock = self.lock.lock();
        let container = self.current(&guard);

        if container.find_entry(addr, hash).is_some() {
            return Ok(false);
        }
        self.create_entry(container, key, hash, value, &guard)?;
        Ok(true)
    }

    /// Returns the value for `key`, creating it with `factory` if the key is absent.
    ///
    /// `factory` runs outside the lock, so two threads racing on the same key may both run it;
    /// only the value that wins the race is stored and returned to both.
    pub fn get_or_add_with<F>(&self, key: &Arc<K>, factory: F) -> Result<V>
    where
        F: FnOnce(&Arc<K>) -> V,
        V: Clone,
    {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let value = factory(key);

        let addr = key_address(&**key);
        let hash = self.hash_of(addr);

        let guard = epoch::pin();
        let _lock = self.lock.lock();
        let container = self.current(&guard);

        // Lost the race: another writer registered the key while the factory ran
        if let Some(existing) = container.get_value(addr, hash) {
            return Ok(existing.clone());
        }
        self.create_entry(container, key, hash, value.clone(), &guard)?;
        Ok(value)
    }

    /// Removes `key`. Returns `Ok(false)` if it was not present.
    ///
    /// The slot stays allocated until the next compaction; the value is released then.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let addr = key_address(key);
        let hash = self.hash_of(addr);

        let guard = epoch::pin();
        let _lock = self.lock.lock();
        self.current(&guard).remove(addr, hash)
    }

    /// Returns an iterator over the live `(key, value)` pairs.
    ///
    /// The iterator holds the writer lock until it is dropped: writers on other threads block
    /// meanwhile, readers do not. Writing to the same table from the thread that holds the
    /// iterator deadlocks.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Number of allocated slots in the current container.
    ///
    /// This is an upper bound on the number of live entries: removed and expired entries keep
    /// their slot until the container is compacted.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        self.current(&guard).first_free()
    }

    /// Returns true if no slot has been allocated since the last compaction.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the current container.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.current(&guard).capacity()
    }

    /// Removes every entry and shrinks back to the initial capacity.
    pub fn clear(&self) -> Result<()> {
        let guard = epoch::pin();
        let _lock = self.lock.lock();
        let container = self.current(&guard);
        container.verify_integrity()?;

        let dropped = container.first_free();
        self.replace_container(Container::new(self.initial_capacity), &guard);
        debug!(dropped, capacity = self.initial_capacity, "weak table cleared");
        Ok(())
    }

    /// Compacts the current container in place of waiting for growth, dropping removed entries
    /// and entries whose key has expired. Returns the number of slots reclaimed.
    pub fn purge_expired(&self) -> Result<usize> {
        let guard = epoch::pin();
        let _lock = self.lock.lock();
        let container = self.current(&guard);
        container.verify_integrity()?;

        if container.count_reclaimable() == 0 {
            return Ok(0);
        }

        let replacement = container.resize_to(container.capacity());
        let kept = replacement.first_free();
        // More keys may have expired since the count above; report what was actually dropped
        let reclaimed = container.first_free() - kept;
        self.replace_container(replacement, &guard);
        debug!(reclaimed, kept, "weak table purged");
        Ok(reclaimed)
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn current<'g>(&self, guard: &'g Guard) -> &'g Container<K, V> {
        let shared = self.container.load(Ordering::Acquire, guard);
        // SAFETY: the pointer is never null while the table is alive, and a replaced container is
        // only destroyed through the epoch once every guard pinned before the swap is gone.
        unsafe { shared.deref() }
    }

    #[inline(always)]
    fn hash_of(&self, addr: usize) -> u64 {
        self.hasher.hash_one(addr) & HASH_MASK
    }

    /// Inserts into `container`, replacing it first when it is full. Must hold `lock`.
    fn create_entry<'g>(
        &self,
        container: &'g Container<K, V>,
        key: &Arc<K>,
        hash: u64,
        value: V,
        guard: &'g Guard,
    ) -> Result<()> {
        let container = if container.has_capacity() {
            container
        } else {
            let old_capacity = container.capacity();
            let replacement = container.resize()?;
            debug!(
                old_capacity,
                new_capacity = replacement.capacity(),
                kept = replacement.first_free(),
                compacted = replacement.capacity() == old_capacity,
                "weak table container replaced"
            );
            self.replace_container(replacement, guard)
        };
        container.create_entry_no_resize(key, hash, value)
    }

    /// Publishes `replacement` and hands the old container to the epoch. Must hold `lock`.
    fn replace_container<'g>(
        &self,
        replacement: Container<K, V>,
        guard: &'g Guard,
    ) -> &'g Container<K, V> {
        let new = Owned::new(replacement).into_shared(guard);
        let old = self.container.swap(new, Ordering::AcqRel, guard);
        // SAFETY: `old` is unreachable from the table now; readers that loaded it are pinned and
        // keep it alive until they unpin. K and V are 'static + Send, so deferring is sound.
        unsafe {
            guard.defer_destroy(old);
            new.deref()
        }
    }
}

// ================================================================================================
// CONTAINER IMPLEMENTATION
// ================================================================================================

impl<K: ?Sized, V> Container<K, V> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            buckets: (0..capacity).map(|_| AtomicUsize::new(END)).collect(),
            entries: (0..capacity).map(|_| Entry::default()).collect(),
            first_free: AtomicUsize::new(0),
            owned_by_newer: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    fn first_free(&self) -> usize {
        self.first_free.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn has_capacity(&self) -> bool {
        self.first_free() < self.capacity()
    }

    #[inline(always)]
    fn bucket(&self, hash: u64) -> &AtomicUsize {
        &self.buckets[hash as usize & (self.capacity() - 1)]
    }

    fn verify_integrity(&self) -> Result<()> {
        if self.invalid.load(Ordering::Acquire) {
            error!(
                capacity = self.capacity(),
                first_free = self.first_free(),
                "weak table container left half written by an interrupted write"
            );
            return Err(TableError::Corrupted);
        }
        Ok(())
    }

    /// Index of the live entry for `addr`. Safe without the lock; expired keys never match.
    fn find_entry(&self, addr: usize, hash: u64) -> Option<usize> {
        let mut index = self.bucket(hash).load(Ordering::Acquire);
        while index != END {
            let entry = &self.entries[index];
            if entry.hash.load(Ordering::Acquire) == hash {
                if let Some(handle) = entry.handle() {
                    if handle.is_key(addr) && handle.is_alive() {
                        return Some(index);
                    }
                }
            }
            index = entry.next.load(Ordering::Relaxed);
        }
        None
    }

    fn get_value(&self, addr: usize, hash: u64) -> Option<&V> {
        let index = self.find_entry(addr, hash)?;
        self.entries[index].handle().map(|handle| &handle.value)
    }

    /// Key and value at `index`, if that entry is neither removed nor expired.
    fn try_get_entry(&self, index: usize) -> Option<(Arc<K>, &V)> {
        let entry = self.entries.get(index)?;
        if entry.hash.load(Ordering::Acquire) == ERASED {
            return None;
        }
        entry.handle()?.target()
    }

    /// Appends a new entry. The container must have capacity and the caller must hold the lock.
    fn create_entry_no_resize(&self, key: &Arc<K>, hash: u64, value: V) -> Result<()> {
        self.verify_integrity()?;
        self.invalid.store(true, Ordering::Relaxed);

        let index = self.first_free.load(Ordering::Relaxed);
        self.first_free.store(index + 1, Ordering::Release);

        let entry = &self.entries[index];
        entry.hash.store(hash, Ordering::Relaxed);
        entry
            .handle
            .store(DependentHandle::alloc(key, value), Ordering::Relaxed);

        let bucket = self.bucket(hash);
        entry.next.store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);

        // Readers that follow the bucket to `index` must see every write above
        bucket.store(index, Ordering::Release);

        self.invalid.store(false, Ordering::Release);
        Ok(())
    }

    /// Erases the entry for `addr`. The handle stays in place for readers already past the hash
    /// check and is released when this container is discarded.
    fn remove(&self, addr: usize, hash: u64) -> Result<bool> {
        self.verify_integrity()?;

        match self.find_entry(addr, hash) {
            Some(index) => {
                let entry = &self.entries[index];
                entry.hash.store(ERASED, Ordering::Release);
                if let Some(handle) = entry.handle() {
                    handle.clear_target();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Counts allocated entries that a compaction would drop.
    fn count_reclaimable(&self) -> usize {
        self.entries[..self.first_free()]
            .iter()
            .filter(|entry| entry.hash.load(Ordering::Acquire) == ERASED || !entry.is_alive())
            .count()
    }

    /// Builds the replacement for a full container: same capacity when removed or expired
    /// entries can be dropped, double capacity otherwise. Must hold the lock.
    fn resize(&self) -> Result<Container<K, V>> {
        self.verify_integrity()?;

        let has_expired = self.entries[..self.first_free()]
            .iter()
            .any(|entry| entry.hash.load(Ordering::Acquire) == ERASED || !entry.is_alive());

        let new_capacity = if has_expired {
            self.capacity()
        } else {
            doubled_capacity(self.capacity())?
        };
        Ok(self.resize_to(new_capacity))
    }

    /// Copies live entries into a fresh container of `new_capacity` and hands their handles over.
    ///
    /// Entries that are not carried over are marked erased here, so this container releases them
    /// itself once it is discarded. Must hold the lock.
    fn resize_to(&self, new_capacity: usize) -> Container<K, V> {
        let replacement = Container::new(new_capacity);
        // Unwinding out of here must not let the half-built replacement release shared handles
        replacement.invalid.store(true, Ordering::Relaxed);

        let mut kept = 0;
        for old in &self.entries[..self.first_free()] {
            let hash = old.hash.load(Ordering::Acquire);
            if hash == ERASED {
                continue;
            }
            let handle = old.handle.load(Ordering::Acquire);
            if handle.is_null() {
                continue;
            }

            if old.is_alive() {
                let entry = &replacement.entries[kept];
                entry.hash.store(hash, Ordering::Relaxed);
                entry.handle.store(handle, Ordering::Relaxed);

                let bucket = replacement.bucket(hash);
                entry.next.store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);
                bucket.store(kept, Ordering::Relaxed);
                kept += 1;
            } else {
                old.hash.store(ERASED, Ordering::Release);
            }
        }

        replacement.first_free.store(kept, Ordering::Relaxed);
        self.owned_by_newer.store(true, Ordering::Release);
        replacement.invalid.store(false, Ordering::Release);
        replacement
    }
}

// ================================================================================================
// ENTRY AND HANDLE IMPLEMENTATION
// ================================================================================================

impl<K: ?Sized, V> Entry<K, V> {
    #[inline(always)]
    fn handle(&self) -> Option<&DependentHandle<K, V>> {
        let ptr = self.handle.load(Ordering::Acquire);
        // SAFETY: non-null handles stay allocated until the container owning them is destroyed,
        // which the epoch defers past every reader of this entry.
        unsafe { ptr.as_ref() }
    }

    #[inline(always)]
    fn is_alive(&self) -> bool {
        self.handle().is_some_and(DependentHandle::is_alive)
    }
}

impl<K: ?Sized, V> DependentHandle<K, V> {
    fn alloc(key: &Arc<K>, value: V) -> *mut Self {
        Box::into_raw(Box::new(Self {
            key: Arc::downgrade(key),
            value,
            cleared: AtomicBool::new(false),
        }))
    }

    #[inline(always)]
    fn is_key(&self, addr: usize) -> bool {
        // The weak count pins the allocation, so no other key can reuse this address
        Weak::as_ptr(&self.key).cast::<()>() as usize == addr
    }

    #[inline(always)]
    fn is_alive(&self) -> bool {
        !self.cleared.load(Ordering::Acquire) && self.key.strong_count() > 0
    }

    fn target(&self) -> Option<(Arc<K>, &V)> {
        if self.cleared.load(Ordering::Acquire) {
            return None;
        }
        self.key.upgrade().map(|key| (key, &self.value))
    }

    fn clear_target(&self) {
        self.cleared.store(true, Ordering::Release);
    }
}

// ================================================================================================
// DROP IMPLEMENTATIONS
// ================================================================================================

impl<K: ?Sized, V> Drop for Container<K, V> {
    fn drop(&mut self) {
        // A container that never finished a write (or was never finished building) may share
        // handles it does not own; leaking them is the only safe option.
        if *self.invalid.get_mut() {
            return;
        }

        let owned_by_newer = *self.owned_by_newer.get_mut();
        let first_free = *self.first_free.get_mut();

        for entry in self.entries[..first_free].iter_mut() {
            let ptr = *entry.handle.get_mut();
            if ptr.is_null() {
                continue;
            }
            // Handles carried over to a successor belong to it; erased ones were never carried.
            if !owned_by_newer || *entry.hash.get_mut() == ERASED {
                // SAFETY: the ownership rule above gives each handle exactly one releasing
                // container, and no reader can reach this container any more.
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

impl<K: ?Sized, V, S> Drop for WeakTable<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers of the current container. Replaced
        // containers still queued in the epoch do not touch the handles this one owns.
        unsafe {
            let guard = epoch::unprotected();
            let current = self.container.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K, V, S> Default for WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTable")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (Arc<K>, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The first value seen for a key wins.
impl<K, V, S> FromIterator<(Arc<K>, V)> for WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (Arc<K>, V)>>(iter: T) -> Self {
        let mut table = Self::default();
        table.extend(iter);
        table
    }
}

impl<K, V, S> Extend<(Arc<K>, V)> for WeakTable<K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (Arc<K>, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            if let Err(err) = self.try_add(&key, value) {
                error!(%err, "weak table dropped an entry while extending");
            }
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

#[inline(always)]
fn key_address<K: ?Sized>(key: &K) -> usize {
    (key as *const K).cast::<()>() as usize
}

/// Calculate container capacity based on size hint
fn calc_capacity(size_hint: usize) -> usize {
    size_hint
        .max(MIN_CAPACITY)
        .checked_next_power_of_two()
        .map_or(MAX_CAPACITY, |capacity| capacity.min(MAX_CAPACITY))
}

/// Capacity of the container that replaces a full one of `capacity` with nothing to compact
fn doubled_capacity(capacity: usize) -> Result<usize> {
    if capacity >= MAX_CAPACITY {
        return Err(TableError::CapacityOverflow { capacity });
    }
    Ok(capacity * 2)
}

// ================================================================================================
// ITERATOR IMPLEMENTATION
// ================================================================================================

/// Iterator over the live pairs of a [`WeakTable`], holding its writer lock.
///
/// Entries appended after the iterator was created are not visited. The lock is released when
/// the iterator is dropped, whether or not it was exhausted.
pub struct Iter<'a, K: ?Sized, V, S = RandomState> {
    container: &'a Container<K, V>,
    _lock: MutexGuard<'a, ()>,
    index: usize,
    end: usize,
    _table: PhantomData<&'a WeakTable<K, V, S>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn new(table: &'a WeakTable<K, V, S>) -> Self {
        let lock = table.lock.lock();
        // SAFETY: only a writer holding `lock` can replace the container, and dropping the
        // table needs `&mut`, so the container outlives `'a` without pinning the epoch.
        let container: &'a Container<K, V> = unsafe {
            table
                .container
                .load(Ordering::Acquire, epoch::unprotected())
                .deref()
        };
        Self {
            container,
            _lock: lock,
            index: 0,
            end: container.first_free(),
            _table: PhantomData,
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: ?Sized + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (Arc<K>, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.end {
            let index = self.index;
            self.index += 1;
            if let Some((key, value)) = self.container.try_get_entry(index) {
                return Some((key, value.clone()));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.index))
    }
}

impl<K, V, S> fmt::Debug for Iter<'_, K, V, S>
where
    K: ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("index", &self.index)
            .field("end", &self.end)
            .finish()
    }
}

// ================================================================================================
// TESTS
// ================================================================================================
