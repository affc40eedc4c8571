//! Component D: the Range Map.
//!
//! Interval map from guest-PC ranges to the set of [`LocationDescriptor`]s
//! whose translated code covers that range (`spec.md` §3, §4.D). There is no
//! `boost::icl`-equivalent crate in the ecosystem this corpus draws from, so
//! this is a small hand-rolled coalescing `BTreeMap` rather than a pulled-in
//! dependency. Only spans with a non-empty LD set are stored; everything
//! else is implicitly uncovered.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::location::{GuestPc, LocationDescriptor};

/// A non-overlapping `[start, end)` span and the LDs whose emitted code
/// covers it. Keyed by `start` in the containing map.
struct Entry {
    end: GuestPc,
    lds: FxHashSet<LocationDescriptor>,
}

/// Component D: guest-PC range → set of LDs.
#[derive(Default)]
pub struct RangeMap {
    /// Keyed by span start; spans never overlap and are never empty.
    entries: BTreeMap<GuestPc, Entry>,
}

impl RangeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every stored span that intersects `[start, end)`,
    /// ordered by start.
    fn drain_overlapping(&mut self, start: GuestPc, end: GuestPc) -> Vec<(GuestPc, Entry)> {
        // A span starting before `start` can still overlap if it extends
        // past `start`; find it first.
        let mut keys: Vec<GuestPc> = Vec::new();
        if let Some((&s, e)) = self.entries.range(..start).next_back() {
            if e.end > start {
                keys.push(s);
            }
        }
        keys.extend(self.entries.range(start..end).map(|(&s, _)| s));

        keys.into_iter()
            .map(|s| (s, self.entries.remove(&s).unwrap()))
            .collect()
    }

    /// `spec.md` §4.D `add_range`: union `{ld}` into the map over
    /// `[start, end)`.
    pub fn add_range(&mut self, start: GuestPc, end: GuestPc, ld: LocationDescriptor) {
        if start >= end {
            return;
        }

        let overlapping = self.drain_overlapping(start, end);

        // Collect every boundary point within [start, end], so the region
        // can be walked sub-range by sub-range.
        let mut bounds = vec![start, end];
        for (s, e) in &overlapping {
            bounds.push((*s).max(start));
            bounds.push(e.end.min(end));
        }
        bounds.sort_unstable();
        bounds.dedup();

        for window in bounds.windows(2) {
            let (lo, hi) = (window[0], window[1]);
            if lo >= hi {
                continue;
            }
            let mut lds: FxHashSet<LocationDescriptor> = overlapping
                .iter()
                .filter(|(s, e)| *s <= lo && e.end >= hi)
                .flat_map(|(_, e)| e.lds.iter().copied())
                .collect();
            lds.insert(ld);
            self.insert_coalescing(lo, hi, lds);
        }

        // Re-insert the parts of overlapping spans that lay outside
        // [start, end) unchanged (drain_overlapping only removes spans that
        // intersect, but a span can extend beyond either edge).
        for (s, e) in overlapping {
            if s < start {
                self.insert_coalescing(s, start, e.lds.clone());
            }
            if e.end > end {
                self.insert_coalescing(end, e.end, e.lds);
            }
        }
    }

    /// Insert `[start, end)` → `lds`, merging with an immediately adjacent
    /// span carrying an identical LD set to keep the map small.
    fn insert_coalescing(&mut self, start: GuestPc, end: GuestPc, lds: FxHashSet<LocationDescriptor>) {
        if start >= end || lds.is_empty() {
            return;
        }
        let mut start = start;
        let mut end = end;

        let merge_prev = self
            .entries
            .range(..start)
            .next_back()
            .filter(|(_, prev)| prev.end == start && prev.lds == lds)
            .map(|(&s, _)| s);
        if let Some(prev_start) = merge_prev {
            self.entries.remove(&prev_start);
            start = prev_start;
        }

        let merge_next = self
            .entries
            .get(&end)
            .filter(|next| next.lds == lds)
            .map(|next| next.end);
        if let Some(next_end) = merge_next {
            self.entries.remove(&end);
            end = next_end;
        }

        self.entries.insert(start, Entry { end, lds });
    }

    /// `spec.md` §8 property 3 / §4.D `query` helper: the LDs covering a
    /// single guest PC.
    #[must_use]
    pub fn query(&self, pc: GuestPc) -> FxHashSet<LocationDescriptor> {
        self.entries
            .range(..=pc)
            .next_back()
            .filter(|(_, entry)| entry.end > pc)
            .map(|(_, entry)| entry.lds.clone())
            .unwrap_or_default()
    }

    /// `spec.md` §4.D `invalidate_ranges`: union of all LD sets intersecting
    /// any `[start, end)` in `ranges`. Per the spec this need not delete the
    /// stale entries, but this implementation opportunistically does
    /// (permitted by §4.D), re-inserting the de-intersected remainder(s) of
    /// any span that extends beyond the invalidated interval.
    pub fn invalidate_ranges(
        &mut self,
        ranges: &[(GuestPc, GuestPc)],
    ) -> FxHashSet<LocationDescriptor> {
        let mut erased = FxHashSet::default();
        for &(start, end) in ranges {
            if start >= end {
                continue;
            }
            for (s, e) in self.drain_overlapping(start, end) {
                erased.extend(e.lds.iter().copied());
                if s < start {
                    self.insert_coalescing(s, start, e.lds.clone());
                }
                if e.end > end {
                    self.insert_coalescing(end, e.end, e.lds);
                }
            }
        }
        erased
    }

    /// Drop every span (`spec.md` §4.D note: the Invalidation Coordinator's
    /// full-clear path resets the arena and Block Index; the Range Map is
    /// reset alongside them).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
