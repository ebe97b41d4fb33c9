//! Merging several independently written rings into one time-ordered stream.

use crate::EventSink;
use tracing::debug;

/// A circular buffer read in passes: a pass covers everything the writer had
/// published when [`begin_pass`](Self::begin_pass) took its snapshot.
pub trait TimestampedRing {
    /// Snapshots the writer cursor. Returns false when nothing is pending.
    fn begin_pass(&mut self) -> bool;

    /// Timestamp of the next sample below the snapshot. Records that are not
    /// samples are skipped. `None` once the snapshot is exhausted.
    fn peek_time(&mut self) -> Option<i64>;

    /// Timestamp of the newest sample below the snapshot, without moving the
    /// read cursor.
    fn last_time(&mut self) -> Option<i64>;

    /// Decodes the record [`peek_time`](Self::peek_time) reported and moves
    /// past it.
    fn pop(&mut self, sink: &mut dyn EventSink);

    /// Moves past the record [`peek_time`](Self::peek_time) reported without
    /// decoding it.
    fn discard(&mut self);

    /// Hands everything read so far back to the writer. Records left unread
    /// stay pending for the next pass.
    fn end_pass(&mut self);
}

/// Reads one ring to its snapshot. Returns the number of samples decoded.
pub fn drain_ring<R: TimestampedRing + ?Sized>(ring: &mut R, sink: &mut dyn EventSink) -> usize {
    if !ring.begin_pass() {
        return 0;
    }
    let mut count = 0;
    while ring.peek_time().is_some() {
        ring.pop(sink);
        count += 1;
    }
    ring.end_pass();
    count
}

/// Advances a ring to its snapshot without decoding anything.
pub fn skip_ring<R: TimestampedRing + ?Sized>(ring: &mut R) -> bool {
    if !ring.begin_pass() {
        return false;
    }
    while ring.peek_time().is_some() {
        ring.discard();
    }
    ring.end_pass();
    true
}

/// Merges rings into a stream that stays non-decreasing across passes.
///
/// Ring snapshots are taken one after another, so a ring can publish an
/// older record just after another ring's newer one was snapshotted. A pass
/// therefore only emits up to the oldest of the rings' newest visible
/// samples and leaves the rest pending. A record that still shows up behind
/// the last emitted time is dropped.
#[derive(Debug, Default)]
pub struct OrderedMerge {
    watermark: Option<i64>,
    late: u64,
}

impl OrderedMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the last emitted sample.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Samples dropped because they arrived behind the watermark.
    pub fn late(&self) -> u64 {
        self.late
    }

    /// One pass over `rings`. Returns the number of samples decoded.
    pub fn pass<R: TimestampedRing>(
        &mut self,
        rings: &mut [R],
        sink: &mut dyn EventSink,
    ) -> usize {
        let begun: Vec<usize> = (0..rings.len())
            .filter(|&idx| rings[idx].begin_pass())
            .collect();
        // Rings without samples do not hold the others back.
        let limit = begun
            .iter()
            .filter_map(|&idx| rings[idx].last_time())
            .min()
            .unwrap_or(i64::MIN);

        let mut active = begun.clone();
        let mut count = 0;
        while !active.is_empty() {
            let mut selected: Option<(usize, i64)> = None;
            let mut i = 0;
            while i < active.len() {
                match rings[active[i]].peek_time() {
                    Some(time) if time <= limit => {
                        if selected.map_or(true, |(_, best)| time < best) {
                            selected = Some((i, time));
                        }
                        i += 1;
                    }
                    _ => {
                        active.remove(i);
                    }
                }
            }
            let Some((i, time)) = selected else {
                continue;
            };
            let ring = &mut rings[active[i]];
            if self.watermark.is_some_and(|mark| time < mark) {
                ring.discard();
                self.late += 1;
                debug!(time, late = self.late, "dropping sample behind the merged stream");
                continue;
            }
            ring.pop(sink);
            self.watermark = Some(time);
            count += 1;
        }

        for idx in begun {
            rings[idx].end_pass();
        }
        count
    }
}
