//! Fixed-capacity value buffers.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::sync::{lock, AtomicU64, AtomicUsize, Backoff, Mutex, Ordering};

/// Default number of slots in a buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

// A signalling NaN with a payload no arithmetic produces. NaN values are rejected before they reach a buffer, so this
// pattern never collides with a written value.
const EMPTY_F64_BITS: u64 = 0x7FF4_0000_0000_0001;

/// A value that can be stored in a [`ValuesBuffer`] slot.
///
/// Each implementation provides an atomic cell that is either empty or holds a value, and an exchange operation on it.
pub trait SlotValue: Send + Sync + Sized + 'static {
    /// The atomic cell type backing a slot.
    type Slot: Send + Sync;

    /// Creates an empty slot.
    fn empty_slot() -> Self::Slot;

    /// Atomically replaces the contents of the slot, returning the previous contents.
    fn exchange(slot: &Self::Slot, value: Option<Self>) -> Option<Self>;
}

impl SlotValue for f64 {
    type Slot = AtomicU64;

    fn empty_slot() -> Self::Slot {
        AtomicU64::new(EMPTY_F64_BITS)
    }

    fn exchange(slot: &Self::Slot, value: Option<Self>) -> Option<Self> {
        let new_bits = value.map_or(EMPTY_F64_BITS, f64::to_bits);
        let old_bits = slot.swap(new_bits, Ordering::AcqRel);
        (old_bits != EMPTY_F64_BITS).then_some(f64::from_bits(old_bits))
    }
}

impl SlotValue for Arc<String> {
    type Slot = ArcSwapOption<String>;

    fn empty_slot() -> Self::Slot {
        ArcSwapOption::empty()
    }

    fn exchange(slot: &Self::Slot, value: Option<Self>) -> Option<Self> {
        slot.swap(value)
    }
}

/// A fixed-capacity buffer supporting lock-free writes from many producers and drains from a single flusher.
///
/// Producers claim a slot with [`increment_write_index`][Self::increment_write_index] and then publish their value with
/// [`write_value`][Self::write_value]. Claims are handed out in strictly increasing order and may run past the capacity
/// of the buffer: a producer holding a claim beyond the capacity must not write, and should instead retry against the
/// buffer that replaces this one.
///
/// Drains happen under a lock scoped to the buffer, which also guards the flush cursor. Since a slot may have been
/// claimed but not yet written when a drain reaches it, draining a slot waits for the value to become visible.
pub struct ValuesBuffer<T: SlotValue> {
    slots: Box<[T::Slot]>,
    claimed: AtomicUsize,
    flush_cursor: Mutex<usize>,
}

impl<T: SlotValue> ValuesBuffer<T> {
    /// Creates a new `ValuesBuffer` with the given capacity.
    ///
    /// A capacity of zero is treated as a capacity of one.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| T::empty_slot()).collect();

        Self {
            slots,
            claimed: AtomicUsize::new(0),
            flush_cursor: Mutex::new(0),
        }
    }

    /// Returns the number of slots in the buffer.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims the next slot, returning its index.
    ///
    /// Indices start at zero and are unique and strictly increasing. An index equal to or greater than the capacity
    /// means the buffer is full.
    pub fn increment_write_index(&self) -> usize {
        self.claimed.fetch_add(1, Ordering::AcqRel)
    }

    /// Writes a value into the given slot.
    ///
    /// The write is an atomic exchange, so a concurrent drain of the same slot either sees the value or sees the slot
    /// as still empty. Indices beyond the capacity are ignored.
    pub fn write_value(&self, index: usize, value: T) {
        if let Some(slot) = self.slots.get(index) {
            T::exchange(slot, Some(value));
        }
    }

    /// Returns the highest index claimed so far, or `None` if no slot has been claimed.
    ///
    /// The result may exceed the capacity of the buffer.
    pub fn peek_last_write_index(&self) -> Option<usize> {
        self.claimed.load(Ordering::Acquire).checked_sub(1)
    }

    /// Takes the value out of the given slot, leaving it empty.
    ///
    /// If the slot has been claimed but its value is not yet visible, this waits until the producer completes its
    /// write. Callers must only call this for claimed indices within the capacity.
    pub fn get_and_reset_value(&self, index: usize) -> T {
        let slot = &self.slots[index];
        let mut backoff = Backoff::new();
        loop {
            if let Some(value) = T::exchange(slot, None) {
                return value;
            }
            backoff.snooze();
        }
    }

    /// Drains every claimed and not-yet-drained slot, in claim order, into `f`.
    ///
    /// Returns the number of values drained.
    pub fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let mut flush_cursor = lock(&self.flush_cursor);
        let end = match self.peek_last_write_index() {
            Some(last) => last.min(self.capacity() - 1) + 1,
            None => 0,
        };

        let start = *flush_cursor;
        for index in start..end {
            f(self.get_and_reset_value(index));
        }
        *flush_cursor = end.max(start);

        end.saturating_sub(start)
    }

    /// Resets the flush cursor and the claims, making every slot available again.
    ///
    /// Slot contents are left untouched, so this must only be used on a buffer that has been fully drained.
    pub fn reset_indices(&self) {
        let mut flush_cursor = lock(&self.flush_cursor);
        *flush_cursor = 0;
        self.claimed.store(0, Ordering::Release);
    }

    /// Resets the indices and empties every slot.
    pub fn reset_indices_and_data(&self) {
        let mut flush_cursor = lock(&self.flush_cursor);
        for slot in self.slots.iter() {
            T::exchange(slot, None);
        }
        *flush_cursor = 0;
        self.claimed.store(0, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn claims_are_sequential() {
        let buffer = ValuesBuffer::<f64>::new(4);
        assert_eq!(buffer.peek_last_write_index(), None);

        for expected in 0..6 {
            assert_eq!(buffer.increment_write_index(), expected);
        }
        assert_eq!(buffer.peek_last_write_index(), Some(5));
    }

    #[test]
    fn drain_is_bounded_by_capacity() {
        let buffer = ValuesBuffer::<f64>::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            let index = buffer.increment_write_index();
            buffer.write_value(index, value);
        }

        let mut drained = Vec::new();
        assert_eq!(buffer.drain(|value| drained.push(value)), 3);
        assert_eq!(drained, vec![1.0, 2.0, 3.0]);

        // Nothing left past the flush cursor.
        assert_eq!(buffer.drain(|value| drained.push(value)), 0);
    }

    #[test]
    fn partial_drains_resume_at_flush_cursor() {
        let buffer = ValuesBuffer::<f64>::new(10);
        let mut drained = Vec::new();

        for value in [1.0, 2.0] {
            let index = buffer.increment_write_index();
            buffer.write_value(index, value);
        }
        buffer.drain(|value| drained.push(value));

        let index = buffer.increment_write_index();
        buffer.write_value(index, 3.0);
        buffer.drain(|value| drained.push(value));

        assert_eq!(drained, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_and_negative_values_are_not_empty() {
        let buffer = ValuesBuffer::<f64>::new(3);
        for value in [0.0, -0.0, f64::INFINITY] {
            let index = buffer.increment_write_index();
            buffer.write_value(index, value);
        }

        let mut drained = Vec::new();
        buffer.drain(|value| drained.push(value));
        assert_eq!(drained.len(), 3);
        assert!(drained[2].is_infinite());
    }

    #[test]
    fn reset_indices_and_data_empties_slots() {
        let buffer = ValuesBuffer::<Arc<String>>::new(2);
        let index = buffer.increment_write_index();
        buffer.write_value(index, Arc::new("a".to_string()));

        buffer.reset_indices_and_data();
        assert_eq!(buffer.peek_last_write_index(), None);
        assert_eq!(buffer.drain(|_| panic!("buffer should be empty")), 0);

        let index = buffer.increment_write_index();
        assert_eq!(index, 0);
        buffer.write_value(index, Arc::new("b".to_string()));
        assert_eq!(buffer.get_and_reset_value(0).as_str(), "b");
    }

    #[test]
    fn drain_waits_for_claimed_write() {
        let buffer = Arc::new(ValuesBuffer::<f64>::new(4));
        let index = buffer.increment_write_index();

        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                buffer.write_value(index, 7.5);
            })
        };

        let mut drained = Vec::new();
        buffer.drain(|value| drained.push(value));
        writer.join().unwrap();

        assert_eq!(drained, vec![7.5]);
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use loom::{sync::Arc, thread};

    use super::*;

    #[test]
    fn concurrent_claim_write_and_drain() {
        // Two producers race a flusher on a buffer with room for both of them; whatever interleaving happens, every
        // written value is drained exactly once.
        loom::model(|| {
            let buffer = Arc::new(ValuesBuffer::<f64>::new(2));

            let producers = [1.0, 2.0]
                .into_iter()
                .map(|value| {
                    let buffer = Arc::clone(&buffer);
                    thread::spawn(move || {
                        let index = buffer.increment_write_index();
                        buffer.write_value(index, value);
                    })
                })
                .collect::<Vec<_>>();

            let mut drained = Vec::new();
            buffer.drain(|value| drained.push(value));

            for producer in producers {
                producer.join().unwrap();
            }
            buffer.drain(|value| drained.push(value));

            drained.sort_by(f64::total_cmp);
            assert_eq!(drained, vec![1.0, 2.0]);
        });
    }
}
