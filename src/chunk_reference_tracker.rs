use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{BuildPatchAppManifest, FGuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ESortDirection {
    /// Soonest needed first.
    Ascending,
    Descending,
}

/// Tracks the order in which chunks will be consumed while constructing files.
///
/// The use stack holds one entry per chunk part with the next needed chunk on top. Reference
/// counts are atomics so they can be read without taking the stack lock.
#[derive(Debug)]
pub struct ChunkReferenceTracker {
    reference_count: HashMap<FGuid, AtomicU32>,
    use_stack: Mutex<Vec<FGuid>>,
}

impl ChunkReferenceTracker {
    /// Uses of every chunk part of `files`, in manifest file order.
    pub fn new<S: AsRef<str>>(manifest: &BuildPatchAppManifest, files: impl IntoIterator<Item = S>) -> Self {
        let files: HashSet<String> = files.into_iter().map(|f| f.as_ref().to_owned()).collect();
        let use_order = manifest
            .files()
            .iter()
            .filter(|f| files.contains(&f.filename))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.guid))
            .collect();
        Self::from_ordered_list(use_order)
    }

    /// `use_order` lists chunk uses first to last.
    pub fn from_ordered_list(mut use_order: Vec<FGuid>) -> Self {
        let mut counts: HashMap<FGuid, u32> = HashMap::new();
        for guid in &use_order {
            *counts.entry(*guid).or_default() += 1;
        }
        use_order.reverse();
        Self {
            reference_count: counts.into_iter().map(|(guid, count)| (guid, AtomicU32::new(count))).collect(),
            use_stack: Mutex::new(use_order),
        }
    }

    fn stack(&self) -> std::sync::MutexGuard<'_, Vec<FGuid>> {
        // the stack is only ever modified by whole push/pop, a poisoned lock still holds valid data
        self.use_stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Chunks that still have uses left.
    pub fn referenced_chunks(&self) -> HashSet<FGuid> {
        self.reference_count
            .iter()
            .filter(|(_, count)| count.load(Ordering::Acquire) > 0)
            .map(|(guid, _)| *guid)
            .collect()
    }

    pub fn reference_count(&self, guid: &FGuid) -> u32 {
        self.reference_count.get(guid).map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Consumes the top of the stack. Fails without changing anything unless `guid` is on top.
    pub fn pop_reference(&self, guid: &FGuid) -> bool {
        let mut stack = self.stack();
        if stack.last() != Some(guid) {
            return false;
        }
        stack.pop();
        if let Some(count) = self.reference_count.get(guid) {
            count.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    /// Up to `count` distinct upcoming chunks accepted by `predicate`, soonest first.
    pub fn next_references(&self, count: usize, predicate: impl Fn(&FGuid) -> bool) -> Vec<FGuid> {
        let stack = self.stack();
        let mut seen = HashSet::new();
        let mut next = vec![];
        for guid in stack.iter().rev() {
            if next.len() >= count {
                break;
            }
            if seen.insert(*guid) && predicate(guid) {
                next.push(*guid);
            }
        }
        next
    }

    /// Orders `chunks` by their position in the use stack. Chunks that are never used again sort
    /// last when ascending. Stable for equal keys.
    pub fn sort_by_use_order(&self, chunks: &mut [FGuid], direction: ESortDirection) {
        let stack = self.stack();
        let mut index_cache: HashMap<FGuid, i64> = HashMap::new();
        let mut index_of = |guid: &FGuid| -> i64 {
            *index_cache
                .entry(*guid)
                .or_insert_with(|| stack.iter().rposition(|g| g == guid).map_or(-1, |i| i as i64))
        };
        let mut keyed: Vec<(i64, FGuid)> = chunks.iter().map(|g| (index_of(g), *g)).collect();
        match direction {
            ESortDirection::Ascending => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
            ESortDirection::Descending => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
        }
        for (dst, (_, guid)) in chunks.iter_mut().zip(keyed) {
            *dst = guid;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::test::sample;
    use crate::manifest_data::test::guid;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_use_stack_order() {
        let manifest = sample();
        let tracker = ChunkReferenceTracker::new(&manifest, manifest.file_list());
        assert_eq!(2, tracker.reference_count(&guid(1)));
        assert_eq!(1, tracker.reference_count(&guid(3)));
        assert_eq!(0, tracker.reference_count(&guid(9)));
        assert_eq!(vec![guid(1), guid(2), guid(3)], tracker.next_references(10, |_| true));
        assert_eq!(vec![guid(1)], tracker.next_references(1, |_| true));
        assert_eq!(vec![guid(2), guid(3)], tracker.next_references(10, |g| *g != guid(1)));

        // out of order consumption is refused
        assert!(!tracker.pop_reference(&guid(2)));
        assert_eq!(1, tracker.reference_count(&guid(2)));

        for g in [guid(1), guid(2), guid(1)] {
            assert!(tracker.pop_reference(&g));
        }
        assert_eq!(HashSet::from([guid(3)]), tracker.referenced_chunks());
        assert!(tracker.pop_reference(&guid(3)));
        assert!(tracker.referenced_chunks().is_empty());
        assert!(!tracker.pop_reference(&guid(3)));
    }

    #[test]
    fn test_file_subset() {
        let manifest = sample();
        let tracker = ChunkReferenceTracker::new(&manifest, ["Content/Paks/Optional.pak"]);
        assert_eq!(HashSet::from([guid(3)]), tracker.referenced_chunks());
    }

    #[test]
    fn test_sort_by_use_order() {
        let tracker = ChunkReferenceTracker::from_ordered_list(vec![guid(1), guid(2), guid(1), guid(3)]);
        let mut chunks = vec![guid(9), guid(3), guid(2), guid(1)];
        tracker.sort_by_use_order(&mut chunks, ESortDirection::Ascending);
        assert_eq!(vec![guid(1), guid(2), guid(3), guid(9)], chunks);
        tracker.sort_by_use_order(&mut chunks, ESortDirection::Descending);
        assert_eq!(vec![guid(9), guid(3), guid(2), guid(1)], chunks);

        // unknown chunks keep their relative order
        let mut unknown = vec![guid(8), guid(7)];
        tracker.sort_by_use_order(&mut unknown, ESortDirection::Ascending);
        assert_eq!(vec![guid(8), guid(7)], unknown);
    }

    #[test]
    fn test_pop_from_other_thread() {
        let tracker = ChunkReferenceTracker::from_ordered_list(vec![guid(1), guid(2)]);
        std::thread::scope(|s| {
            s.spawn(|| assert!(tracker.pop_reference(&guid(1))));
        });
        assert_eq!(0, tracker.reference_count(&guid(1)));
        assert_eq!(vec![guid(2)], tracker.next_references(5, |_| true));
    }
}
