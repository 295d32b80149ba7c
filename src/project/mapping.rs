//! Global trace numbering over the enabled trace sets of a project

use crate::core::{MappedRange, TraceSet, TraceSource};
use anyhow::Result;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("trace {0} is not in any mapped range")]
    NotMapped(usize),

    #[error("trace set holding trace {0} has no data loaded")]
    NotLoaded(usize),
}

/// Assign contiguous ranges to the enabled sets, in list order
///
/// Each enabled set gets `[start, start + num_traces]`; the next set starts
/// one past that end. Disabled sets lose their range.
pub fn assign_ranges(sets: &mut [TraceSet]) {
    let mut start = 0;

    for set in sets.iter_mut() {
        if set.enabled {
            let end = start + set.num_traces;
            set.mapped_range = Some(MappedRange { start, end });
            start = end + 1;
        } else {
            set.mapped_range = None;
        }
    }
}

/// Read-only view answering "trace n" queries across mapped sets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceIndex {
    num_traces: usize,
    num_points: usize,
    known_key: Option<Vec<u8>>,
}

impl TraceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, including the known key
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Refresh totals after the ranges changed
    ///
    /// The known key is taken from the first mapped set that has one and then
    /// kept until `reset`.
    pub fn update(&mut self, sets: &[TraceSet]) {
        let mapped = || sets.iter().filter_map(|s| s.mapped_range.map(|r| (s, r)));

        self.num_traces = mapped().map(|(_, r)| r.end).max().unwrap_or(0);
        self.num_points = mapped().map(|(s, _)| s.points).max().unwrap_or(0);

        if self.known_key.is_none() {
            self.known_key = mapped().find_map(|(s, _)| s.data().and_then(|d| d.known_key()));
        }

        debug!(
            "Trace index updated: {} traces, {} points, key {}",
            self.num_traces,
            self.num_points,
            if self.known_key.is_some() { "known" } else { "unknown" }
        );
    }

    /// End of the last mapped range
    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Largest points-per-trace among mapped sets
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Key shared by all traces (first one seen)
    pub fn known_key(&self) -> Option<&[u8]> {
        self.known_key.as_deref()
    }

    /// Find the set whose range contains `n`, with `n` converted to a local index
    pub fn find_mapped<'a>(
        &self,
        sets: &'a [TraceSet],
        n: usize,
    ) -> std::result::Result<(&'a TraceSet, usize), MappingError> {
        sets.iter()
            .find_map(|s| match s.mapped_range {
                Some(range) if range.contains(n) => Some((s, n - range.start)),
                _ => None,
            })
            .ok_or(MappingError::NotMapped(n))
    }

    fn source<'a>(&self, sets: &'a [TraceSet], n: usize) -> Result<(&'a dyn TraceSource, usize)> {
        let (set, local) = self.find_mapped(sets, n)?;
        let data = set.data().ok_or(MappingError::NotLoaded(n))?;
        Ok((data, local))
    }

    pub fn get_trace(&self, sets: &[TraceSet], n: usize) -> Result<Vec<f64>> {
        let (data, local) = self.source(sets, n)?;
        data.get_trace(local)
    }

    pub fn get_textin(&self, sets: &[TraceSet], n: usize) -> Result<Vec<u8>> {
        let (data, local) = self.source(sets, n)?;
        data.get_textin(local)
    }

    pub fn get_textout(&self, sets: &[TraceSet], n: usize) -> Result<Vec<u8>> {
        let (data, local) = self.source(sets, n)?;
        data.get_textout(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TraceBatch;

    /// Set of `n` traces whose samples are `[tag, local index]`
    fn tagged_set(tag: f64, n: usize, enabled: bool) -> TraceSet {
        let traces = (0..n).map(|i| vec![tag, i as f64]).collect();
        let mut set = TraceSet {
            num_traces: n,
            points: 2,
            enabled,
            ..TraceSet::default()
        };
        set.set_data(Box::new(TraceBatch::new(traces)));
        set
    }

    #[test]
    fn test_ranges_contiguous_and_non_overlapping() {
        let mut sets = vec![
            tagged_set(1.0, 10, true),
            tagged_set(2.0, 5, true),
            tagged_set(3.0, 20, true),
        ];
        assign_ranges(&mut sets);

        let ranges: Vec<_> = sets.iter().map(|s| s.mapped_range.unwrap()).collect();
        assert_eq!(ranges[0], MappedRange { start: 0, end: 10 });
        assert_eq!(ranges[1], MappedRange { start: 11, end: 16 });
        assert_eq!(ranges[2], MappedRange { start: 17, end: 37 });

        for pair in ranges.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + 1);
        }
    }

    #[test]
    fn test_disabled_sets_are_skipped() {
        let mut sets = vec![
            tagged_set(1.0, 10, true),
            tagged_set(2.0, 5, false),
            tagged_set(3.0, 20, true),
        ];
        sets[1].mapped_range = Some(MappedRange { start: 99, end: 104 });
        assign_ranges(&mut sets);

        assert_eq!(sets[0].mapped_range, Some(MappedRange { start: 0, end: 10 }));
        assert_eq!(sets[1].mapped_range, None);
        assert_eq!(sets[2].mapped_range, Some(MappedRange { start: 11, end: 31 }));
    }

    #[test]
    fn test_lookup_delegates_to_owning_set() {
        let mut sets = vec![tagged_set(1.0, 10, true), tagged_set(2.0, 5, true)];
        assign_ranges(&mut sets);
        let mut index = TraceIndex::new();
        index.update(&sets);

        assert_eq!(index.get_trace(&sets, 0).unwrap(), vec![1.0, 0.0]);
        assert_eq!(index.get_trace(&sets, 9).unwrap(), vec![1.0, 9.0]);
        assert_eq!(index.get_trace(&sets, 11).unwrap(), vec![2.0, 0.0]);
        assert_eq!(index.get_trace(&sets, 15).unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_unmapped_index_is_error() {
        let mut sets = vec![tagged_set(1.0, 10, true), tagged_set(2.0, 5, true)];
        assign_ranges(&mut sets);
        let index = TraceIndex::new();

        for n in [10, 16, 500] {
            let err = index.get_trace(&sets, n).unwrap_err();
            assert_eq!(err.downcast_ref::<MappingError>(), Some(&MappingError::NotMapped(n)));
        }
    }

    #[test]
    fn test_totals() {
        let mut sets = vec![tagged_set(1.0, 10, true), tagged_set(2.0, 5, true)];
        sets[1].points = 400;
        assign_ranges(&mut sets);

        let mut index = TraceIndex::new();
        index.update(&sets);
        assert_eq!(index.num_traces(), 16);
        assert_eq!(index.num_points(), 400);

        for set in sets.iter_mut() {
            set.enabled = false;
        }
        assign_ranges(&mut sets);
        index.update(&sets);
        assert_eq!(index.num_traces(), 0);
        assert_eq!(index.num_points(), 0);
    }

    #[test]
    fn test_known_key_first_seen() {
        let mut first = TraceBatch::new(vec![vec![0.0]]);
        first.known_key = Some(vec![1, 1]);
        let mut second = TraceBatch::new(vec![vec![0.0]]);
        second.known_key = Some(vec![2, 2]);

        let mut sets = vec![TraceSet::default(), TraceSet::default()];
        for (set, batch) in sets.iter_mut().zip([first, second]) {
            set.enabled = true;
            set.num_traces = 1;
            set.set_data(Box::new(batch));
        }
        assign_ranges(&mut sets);

        let mut index = TraceIndex::new();
        index.update(&sets);
        assert_eq!(index.known_key(), Some(&[1u8, 1][..]));

        // Disabling the first set keeps the key already seen
        sets[0].enabled = false;
        assign_ranges(&mut sets);
        index.update(&sets);
        assert_eq!(index.known_key(), Some(&[1u8, 1][..]));

        index.reset();
        index.update(&sets);
        assert_eq!(index.known_key(), Some(&[2u8, 2][..]));
    }

    #[test]
    fn test_mapped_set_without_data() {
        let mut sets = vec![TraceSet {
            enabled: true,
            num_traces: 3,
            ..TraceSet::default()
        }];
        assign_ranges(&mut sets);
        let index = TraceIndex::new();

        let err = index.get_textin(&sets, 1).unwrap_err();
        assert_eq!(err.downcast_ref::<MappingError>(), Some(&MappingError::NotLoaded(1)));
    }
}
