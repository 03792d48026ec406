//! Sequence-number reorder buffer for packets arriving over UDP.

use std::collections::BTreeMap;

/// Reorders packets by 16-bit sequence number.
///
/// Packets are released through the caller's `on_sorted` closure, strictly in
/// sequence order and wrapping at `u16::MAX`. A missing packet holds back
/// everything after it until the cache grows past the current sort window;
/// then the gap is given up on and the next available packet is released.
///
/// The sort window starts at `MIN` and tracks `MIN + cached packets` up to
/// `MAX`, so a jittery link buys itself a deeper buffer.
///
/// - The first packet (after construction or [`clear`](Self::clear))
///   anchors the expected sequence.
/// - A packet less than `MAX` behind the expected sequence is late and is
///   dropped.
/// - A packet more than half the sequence space ahead of the expected one
///   is out of window and is dropped. A real sender restart shows up as a
///   new SSRC and is handled by [`clear`](Self::clear).
/// - Every wrap of the released sequence increments
///   [`cycle_count`](Self::cycle_count).
#[derive(Debug)]
pub struct PacketSortor<T, const MAX: usize = 1024, const MIN: usize = 32> {
    next_seq_out: Option<u16>,
    last_seq_out: Option<u16>,
    seq_cycle_count: usize,
    max_sort_size: usize,
    cache: BTreeMap<u16, T>,
}

impl<T, const MAX: usize, const MIN: usize> Default for PacketSortor<T, MAX, MIN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const MAX: usize, const MIN: usize> PacketSortor<T, MAX, MIN> {
    pub fn new() -> Self {
        Self {
            next_seq_out: None,
            last_seq_out: None,
            seq_cycle_count: 0,
            max_sort_size: MIN,
            cache: BTreeMap::new(),
        }
    }

    /// Drop cached packets and forget the sequence anchor.
    pub fn clear(&mut self) {
        self.next_seq_out = None;
        self.last_seq_out = None;
        self.seq_cycle_count = 0;
        self.max_sort_size = MIN;
        self.cache.clear();
    }

    /// Packets currently held back.
    pub fn jitter_size(&self) -> usize {
        self.cache.len()
    }

    /// Number of times the released sequence wrapped past `u16::MAX`.
    pub fn cycle_count(&self) -> usize {
        self.seq_cycle_count
    }

    /// Sequence number the sorter is waiting for.
    pub fn next_seq(&self) -> Option<u16> {
        self.next_seq_out
    }

    /// Insert one packet and release whatever is now in order.
    pub fn sort_packet(&mut self, seq: u16, packet: T, mut on_sorted: impl FnMut(u16, T)) {
        let next = *self.next_seq_out.get_or_insert(seq);

        let behind = next.wrapping_sub(seq) as usize;
        if behind != 0 && behind < MAX {
            tracing::trace!(seq, next, "late packet dropped");
            return;
        }
        if seq.wrapping_sub(next) > u16::MAX / 2 {
            tracing::debug!(seq, next, "out-of-window sequence jump dropped");
            return;
        }

        self.cache.insert(seq, packet);
        self.try_pop(&mut on_sorted);
    }

    /// Release every cached packet in sequence order.
    pub fn flush(&mut self, mut on_sorted: impl FnMut(u16, T)) {
        while let Some(seq) = self.nearest_cached() {
            self.pop_seq(seq, &mut on_sorted);
        }
    }

    fn try_pop(&mut self, on_sorted: &mut impl FnMut(u16, T)) {
        let mut count = self.pop_in_order(on_sorted);

        if count == 0 && self.cache.len() > self.max_sort_size {
            // sort window overflowed: give up on the gap
            if let Some(seq) = self.nearest_cached() {
                tracing::debug!(
                    expected = ?self.next_seq_out,
                    resumed_at = seq,
                    "sequence gap skipped"
                );
                self.pop_seq(seq, on_sorted);
                count = 1 + self.pop_in_order(on_sorted);
            }
        }

        if count > 0 {
            self.max_sort_size = (MIN + self.cache.len()).min(MAX);
        }
    }

    fn pop_in_order(&mut self, on_sorted: &mut impl FnMut(u16, T)) -> usize {
        let mut count = 0;
        while let Some(next) = self.next_seq_out {
            let Some(packet) = self.cache.remove(&next) else {
                break;
            };
            self.emit(next, packet, on_sorted);
            count += 1;
        }
        count
    }

    /// First cached sequence at or after the expected one, in wrapping order.
    fn nearest_cached(&self) -> Option<u16> {
        let next = self.next_seq_out.unwrap_or(0);
        self.cache
            .range(next..)
            .next()
            .or_else(|| self.cache.range(..next).next())
            .map(|(seq, _)| *seq)
    }

    fn pop_seq(&mut self, seq: u16, on_sorted: &mut impl FnMut(u16, T)) {
        if let Some(packet) = self.cache.remove(&seq) {
            self.emit(seq, packet, on_sorted);
        }
    }

    fn emit(&mut self, seq: u16, packet: T, on_sorted: &mut impl FnMut(u16, T)) {
        if self.last_seq_out.is_some_and(|last| seq < last) {
            self.seq_cycle_count += 1;
        }
        self.last_seq_out = Some(seq);
        self.next_seq_out = Some(seq.wrapping_add(1));
        on_sorted(seq, packet);
    }
}
