//! Single-writer, multi-reader broadcast ring.
//!
//! One [`RingBuffer`] exists per track. The ingest side writes every frame
//! (or RTP packet) into it; each egress session holds a [`RingReader`] with
//! its own cursor and either pulls with [`RingReader::read`] or receives a
//! push callback.
//!
//! ```text
//!              RingBuffer<T>  (producer handle, not Clone)
//!         ┌──────────────────────────────────────────┐
//!         │ storage: RwLock<[T; n], write, key pos>  │
//!         │ registry: Mutex<slot table>              │
//!         │   [0] gen 3 ─ Weak<ReaderEntry>          │
//!         │   [1] gen 1 ─ (free)                     │
//!         │   [2] gen 0 ─ Weak<ReaderEntry>          │
//!         └───────────────┬──────────────────────────┘
//!                         │ write(): snapshot registry, call each
//!                         │ read callback with no lock held
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!    RingReader {key: 0/3}         RingReader {key: 2/0}
//! ```
//!
//! ## Callback contract
//!
//! Read callbacks run synchronously on the producer's thread inside
//! [`RingBuffer::write`]. A slow callback stalls the producer and every
//! other reader; callbacks must be cheap or hand the item to their own
//! queue. A callback must not install callbacks on its own reader, and must
//! not call [`RingBuffer::write`] on the ring that invoked it: the reader's
//! callback lock is not reentrant and the write would deadlock. Pulling
//! with [`RingReader::read`] from inside a callback is fine.
//!
//! ## Lifetime
//!
//! Readers keep the shared storage alive but not the producer. Dropping the
//! [`RingBuffer`] detaches every reader exactly once: registry generations
//! are bumped, each reader's detach callback fires, and further pulls
//! return `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

/// Capacity of an auto-sized ring before the GOP has been measured.
pub const DEFAULT_RING_SIZE: usize = 32;

/// Smallest capacity the GOP measurement may pick.
const MIN_RING_SIZE: usize = 2;

type ReadCallback<T> = Box<dyn FnMut(&T) + Send>;
type DetachCallback = Box<dyn FnOnce() + Send>;

/// Registry handle of a reader: slot index plus the generation it was
/// issued under. A handle whose generation no longer matches its slot is
/// stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderKey {
    index: usize,
    generation: u64,
}

struct ReaderEntry<T> {
    /// Absolute write sequence of the next item to read.
    cursor: AtomicUsize,
    on_read: Mutex<Option<ReadCallback<T>>>,
    on_detach: Mutex<Option<DetachCallback>>,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Weak<ReaderEntry<T>>>,
}

/// Slot table of attached readers.
struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, entry: Weak<ReaderEntry<T>>) -> ReaderKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.entry = Some(entry);
            return ReaderKey {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ReaderKey {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    fn is_current(&self, key: ReaderKey) -> bool {
        self.slots
            .get(key.index)
            .is_some_and(|slot| slot.generation == key.generation && slot.entry.is_some())
    }

    fn remove(&mut self, key: ReaderKey) -> bool {
        if !self.is_current(key) {
            return false;
        }
        let slot = &mut self.slots[key.index];
        slot.entry = None;
        slot.generation += 1;
        self.free.push(key.index);
        self.live -= 1;
        true
    }

    /// Live entries, cloned so callbacks can run after the lock is released.
    fn snapshot(&self) -> Vec<Arc<ReaderEntry<T>>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().and_then(Weak::upgrade))
            .collect()
    }

    /// Invalidate every handle and hand back the entries still alive.
    fn detach_all(&mut self) -> Vec<Arc<ReaderEntry<T>>> {
        let live = self.snapshot();
        for slot in &mut self.slots {
            slot.entry = None;
            slot.generation += 1;
        }
        self.free.clear();
        self.live = 0;
        live
    }
}

/// One-shot GOP length measurement.
#[derive(Debug)]
struct GopMeasure {
    total: usize,
    first_key_at: Option<usize>,
}

/// Items live at `seq % capacity`; sequences restart at 0 on resize.
struct Storage<T> {
    items: Vec<Option<T>>,
    written: usize,
    key_seq: usize,
    measure: Option<GopMeasure>,
}

impl<T> Storage<T> {
    fn new(capacity: usize, auto_size: bool) -> Self {
        Self {
            items: empty_slots(capacity),
            written: 0,
            key_seq: 0,
            measure: auto_size.then_some(GopMeasure {
                total: 0,
                first_key_at: None,
            }),
        }
    }

    fn slot(&self, seq: usize) -> usize {
        seq % self.items.len()
    }

    /// Oldest sequence still stored.
    fn oldest(&self) -> usize {
        self.written.saturating_sub(self.items.len())
    }

    /// Count one write; returns the new capacity when the second keyframe
    /// completes the measurement.
    fn measure(&mut self, is_key: bool) -> Option<usize> {
        let m = self.measure.as_mut()?;
        m.total += 1;
        if !is_key {
            return None;
        }
        match m.first_key_at {
            Some(first) => {
                let size = (m.total - first).max(MIN_RING_SIZE);
                self.measure = None;
                Some(size)
            }
            None => {
                m.first_key_at = Some(m.total);
                None
            }
        }
    }

    fn resize(&mut self, capacity: usize) {
        self.items = empty_slots(capacity);
        self.written = 0;
        self.key_seq = 0;
    }
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    (0..capacity).map(|_| None).collect()
}

struct Shared<T> {
    storage: RwLock<Storage<T>>,
    registry: Mutex<Registry<T>>,
}

/// Producer side of the broadcast ring.
///
/// Writes must come from one thread at a time; the handle is deliberately
/// not `Clone`. See the [module docs](self) for the callback contract.
pub struct RingBuffer<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> RingBuffer<T> {
    /// Auto-sized ring: starts at [`DEFAULT_RING_SIZE`] and resizes once to
    /// the distance between the first two keyframes.
    pub fn new() -> Self {
        Self::build(DEFAULT_RING_SIZE, true)
    }

    /// Fixed-size ring that never resizes. A capacity of 0 selects the
    /// auto-sized ring.
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            return Self::new();
        }
        Self::build(capacity.max(MIN_RING_SIZE), false)
    }

    fn build(capacity: usize, auto_size: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage: RwLock::new(Storage::new(capacity, auto_size)),
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    /// Register a reader positioned at the last keyframe.
    pub fn attach(&self) -> RingReader<T> {
        let storage = self.shared.storage.read();
        let entry = Arc::new(ReaderEntry {
            cursor: AtomicUsize::new(storage.key_seq),
            on_read: Mutex::new(None),
            on_detach: Mutex::new(None),
        });
        let key = self.shared.registry.lock().insert(Arc::downgrade(&entry));
        drop(storage);

        tracing::debug!(index = key.index, generation = key.generation, "ring reader attached");
        RingReader {
            shared: self.shared.clone(),
            key,
            entry,
        }
    }

    /// Append `item` and fan it out to every reader's callback.
    ///
    /// `is_key` marks a position new readers may start from.
    pub fn write(&self, item: T, is_key: bool) {
        {
            let mut storage = self.shared.storage.write();
            if let Some(capacity) = storage.measure(is_key) {
                let old = storage.items.len();
                storage.resize(capacity);
                for reader in self.shared.registry.lock().snapshot() {
                    reader.cursor.store(0, Ordering::Release);
                }
                tracing::debug!(from = old, to = capacity, "ring resized to GOP length");
            }

            let seq = storage.written;
            let slot = storage.slot(seq);
            storage.items[slot] = Some(item.clone());
            if is_key {
                storage.key_seq = seq;
            }
            storage.written = seq + 1;
        }

        let readers = self.shared.registry.lock().snapshot();
        for reader in readers {
            if let Some(cb) = reader.on_read.lock().as_mut() {
                cb(&item);
            }
        }
    }

    pub fn reader_count(&self) -> usize {
        self.shared.registry.lock().live
    }

    pub fn capacity(&self) -> usize {
        self.shared.storage.read().items.len()
    }

    /// Slot of the most recent keyframe.
    pub fn key_position(&self) -> usize {
        let storage = self.shared.storage.read();
        storage.slot(storage.key_seq)
    }

    /// Slot the next write goes to.
    pub fn write_position(&self) -> usize {
        let storage = self.shared.storage.read();
        storage.slot(storage.written)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let readers = self.shared.registry.lock().detach_all();
        if !readers.is_empty() {
            tracing::debug!(readers = readers.len(), "ring destroyed, detaching readers");
        }
        for reader in readers {
            if let Some(cb) = reader.on_detach.lock().take() {
                cb();
            }
        }
    }
}

/// Consumer side of the broadcast ring.
///
/// Dropping the reader unregisters it; its callbacks are never invoked
/// again after the drop returns.
pub struct RingReader<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    key: ReaderKey,
    entry: Arc<ReaderEntry<T>>,
}

impl<T: Clone + Send + Sync + 'static> RingReader<T> {
    /// Push mode: `cb` receives every item written from now on, on the
    /// producer thread. Also moves the pull cursor back to the keyframe.
    ///
    /// `cb` must not write to this ring; see the [module docs](self).
    pub fn set_read_callback(&self, cb: impl FnMut(&T) + Send + 'static) {
        *self.entry.on_read.lock() = Some(Box::new(cb));
        self.reset(true);
    }

    /// Called once when the producer drops the ring.
    pub fn set_detach_callback(&self, cb: impl FnOnce() + Send + 'static) {
        *self.entry.on_detach.lock() = Some(Box::new(cb));
    }

    /// Pull mode: next unread item, or `None` when caught up or detached.
    ///
    /// A reader that falls more than one ring length behind silently loses
    /// the overwritten items.
    pub fn read(&self) -> Option<T> {
        if self.is_detached() {
            return None;
        }
        let storage = self.shared.storage.read();
        let mut cursor = self.entry.cursor.load(Ordering::Acquire);
        if cursor > storage.written {
            // attached before a resize restarted the sequence
            cursor = storage.key_seq;
        }
        if cursor >= storage.written {
            return None;
        }
        if cursor < storage.oldest() {
            tracing::debug!(lost = storage.oldest() - cursor, "ring reader overrun");
            cursor = storage.oldest();
        }
        let item = storage.items[storage.slot(cursor)].clone();
        self.entry.cursor.store(cursor + 1, Ordering::Release);
        item
    }

    /// Move the cursor to the last keyframe (`to_key`) or to the write
    /// position, skipping everything buffered.
    pub fn reset(&self, to_key: bool) {
        let storage = self.shared.storage.read();
        let seq = if to_key { storage.key_seq } else { storage.written };
        self.entry.cursor.store(seq, Ordering::Release);
    }

    /// Slot the next read comes from.
    pub fn cursor(&self) -> usize {
        let storage = self.shared.storage.read();
        storage.slot(self.entry.cursor.load(Ordering::Acquire))
    }

    pub fn key(&self) -> ReaderKey {
        self.key
    }

    /// The producer is gone; no more items will arrive.
    pub fn is_detached(&self) -> bool {
        !self.shared.registry.lock().is_current(self.key)
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RingReader<T> {
    fn drop(&mut self) {
        if self.shared.registry.lock().remove(self.key) {
            tracing::debug!(index = self.key.index, "ring reader released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn collector<T: Clone + Send + Sync + 'static>(
        reader: &RingReader<T>,
    ) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reader.set_read_callback(move |item: &T| sink.lock().push(item.clone()));
        seen
    }

    #[test]
    fn push_readers_see_every_write_in_order() {
        let ring = RingBuffer::with_capacity(8);
        let a = ring.attach();
        let b = ring.attach();
        let seen_a = collector(&a);
        let seen_b = collector(&b);

        for i in 0..20 {
            ring.write(i, i % 5 == 0);
        }
        let expected: Vec<i32> = (0..20).collect();
        assert_eq!(*seen_a.lock(), expected);
        assert_eq!(*seen_b.lock(), expected);
    }

    #[test]
    fn pull_reader_reads_in_order() {
        let ring = RingBuffer::with_capacity(16);
        let reader = ring.attach();
        for i in 0..5 {
            ring.write(i, i == 0);
        }
        let got: Vec<i32> = std::iter::from_fn(|| reader.read()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(reader.read(), None);
    }

    #[test]
    fn late_reader_starts_at_last_keyframe() {
        let ring = RingBuffer::with_capacity(32);
        for i in 0..12 {
            ring.write(i, i == 0 || i == 7);
        }
        let reader = ring.attach();
        assert_eq!(reader.cursor(), 7);
        let got: Vec<i32> = std::iter::from_fn(|| reader.read()).collect();
        assert_eq!(got, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn write_before_any_keyframe_is_accepted() {
        let ring = RingBuffer::with_capacity(8);
        ring.write(1, false);
        ring.write(2, false);
        assert_eq!(ring.key_position(), 0);
        let reader = ring.attach();
        assert_eq!(reader.read(), Some(1));
    }

    #[test]
    fn auto_size_measures_first_gop() {
        let ring = RingBuffer::new();
        assert_eq!(ring.capacity(), DEFAULT_RING_SIZE);
        let early = ring.attach();

        ring.write("K1".to_string(), true);
        for i in 0..9 {
            ring.write(format!("P{i}"), false);
        }
        ring.write("K2".to_string(), true);

        assert_eq!(ring.capacity(), 10);
        assert_eq!(ring.key_position(), 0);
        let fresh = ring.attach();
        assert_eq!(fresh.cursor(), ring.key_position());
        assert_eq!(fresh.read().as_deref(), Some("K2"));
        // readers attached before the resize were moved to the anchor too
        assert_eq!(early.read().as_deref(), Some("K2"));
    }

    #[test]
    fn auto_size_happens_once() {
        let ring = RingBuffer::new();
        ring.write(0, true);
        for i in 1..5 {
            ring.write(i, false);
        }
        ring.write(5, true);
        assert_eq!(ring.capacity(), 5);

        for i in 6..30 {
            ring.write(i, false);
        }
        ring.write(30, true);
        assert_eq!(ring.capacity(), 5);
    }

    #[test]
    fn fixed_capacity_never_resizes() {
        let ring = RingBuffer::with_capacity(7);
        ring.write(0, true);
        ring.write(1, false);
        ring.write(2, true);
        assert_eq!(ring.capacity(), 7);
    }

    #[test]
    fn lagging_reader_loses_overwritten_items() {
        let ring = RingBuffer::with_capacity(4);
        let reader = ring.attach();
        for i in 1..=5 {
            ring.write(i, false);
        }
        let got: Vec<i32> = std::iter::from_fn(|| reader.read()).collect();
        assert_eq!(got, vec![2, 3, 4, 5]);
    }

    #[test]
    fn full_ring_is_not_empty() {
        let ring = RingBuffer::with_capacity(4);
        for i in 0..4 {
            ring.write(i, i == 0);
        }
        assert_eq!(ring.write_position(), ring.key_position());
        let reader = ring.attach();
        let got: Vec<i32> = std::iter::from_fn(|| reader.read()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reset_skips_to_write_position() {
        let ring = RingBuffer::with_capacity(8);
        let reader = ring.attach();
        ring.write(1, true);
        ring.write(2, false);
        reader.reset(false);
        assert_eq!(reader.read(), None);
        ring.write(3, false);
        assert_eq!(reader.read(), Some(3));
        reader.reset(true);
        assert_eq!(reader.read(), Some(1));
    }

    #[test]
    fn dropped_reader_is_unregistered() {
        let ring = RingBuffer::with_capacity(4);
        let a = ring.attach();
        let b = ring.attach();
        let seen = collector(&b);
        assert_eq!(ring.reader_count(), 2);

        drop(b);
        assert_eq!(ring.reader_count(), 1);
        ring.write(1, true);
        assert!(seen.lock().is_empty());

        // the freed slot is reused under a new generation
        let c = ring.attach();
        assert_eq!(c.key().index, 1);
        assert_ne!(c.key().generation, 0);
        assert!(!a.is_detached());
    }

    #[test]
    fn drop_detaches_readers_once() {
        let ring = RingBuffer::with_capacity(4);
        let reader = ring.attach();
        let detached = Arc::new(AtomicUsize::new(0));
        let counter = detached.clone();
        reader.set_detach_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ring.write(1, true);

        drop(ring);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert!(reader.is_detached());
        assert_eq!(reader.read(), None);
        drop(reader);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_run_on_producer_thread() {
        let ring = RingBuffer::with_capacity(4);
        let reader = ring.attach();
        let producer = std::thread::current().id();
        let same_thread = Arc::new(AtomicBool::new(false));
        let flag = same_thread.clone();
        reader.set_read_callback(move |_: &u8| {
            flag.store(std::thread::current().id() == producer, Ordering::SeqCst);
        });
        ring.write(1, true);
        assert!(same_thread.load(Ordering::SeqCst));
    }

    #[test]
    fn pull_reader_on_another_thread() {
        let ring = RingBuffer::with_capacity(64);
        let reader = ring.attach();
        for i in 0..10u32 {
            ring.write(i, i == 0);
        }
        let handle = std::thread::spawn(move || std::iter::from_fn(|| reader.read()).collect::<Vec<_>>());
        assert_eq!(handle.join().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn callback_may_pull_from_its_own_ring() {
        let ring = Arc::new(RingBuffer::with_capacity(8));
        let reader = Arc::new(ring.attach());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (r, s) = (reader.clone(), seen.clone());
        reader.set_read_callback(move |_: &i32| {
            while let Some(item) = r.read() {
                s.lock().push(item);
            }
        });
        for i in 0..3 {
            ring.write(i, i == 0);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
