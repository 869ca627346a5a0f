//! Bucketed allocator over a fixed region.
//!
//! # Layout
//!
//! Every chunk is `[tag][payload][tag]`. A tag holds the payload size with the
//! high bit set while the chunk is allocated, so both neighbours of a chunk can
//! be inspected in constant time when it is freed.
//!
//! Free chunks keep the previous and next free-list offsets in the first 16
//! payload bytes. Payloads of `MIN_ALLOC + i * ALIGNMENT` bytes are filed in
//! bucket `i`; everything at or above the last bucket's size shares the last
//! bucket and is served best-fit.

use std::fmt;

use thiserror::Error;
use tracing::{debug, error};

use crate::stats::ArenaStats;
use crate::{ALIGNMENT, BUCKET_COUNT, CHUNK_OVERHEAD, MIN_ALLOC};

const TAG_SIZE: u64 = 8;
const USED_FLAG: u64 = 1 << 63;
const NIL: u64 = u64::MAX;
const LARGE_BUCKET: usize = BUCKET_COUNT - 1;

/// Errors from arena creation and chunk validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("region of {size} bytes is smaller than the minimum of {min} bytes")]
    RegionTooSmall { size: u64, min: u64 },

    #[error("region of {size} bytes cannot be addressed on this platform")]
    RegionTooLarge { size: u64 },

    #[error("chunk at offset {offset} lies outside the region of {total} bytes")]
    OutOfBounds { offset: u64, total: u64 },

    #[error("chunk at offset {offset} is not allocated")]
    NotAllocated { offset: u64 },

    #[error("chunk at offset {offset} has mismatched boundary tags")]
    CorruptTags { offset: u64 },
}

/// Handle to an allocated chunk.
///
/// The value is the payload offset inside the owning arena. A handle is only
/// meaningful for the arena that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk(u64);

impl Chunk {
    /// Payload offset within the region.
    pub fn offset(&self) -> u64 {
        self.0
    }
}

/// Fixed-size region with bucketed free lists.
pub struct Arena {
    name: String,
    region: Box<[u8]>,
    buckets: [u64; BUCKET_COUNT],
    free_size: u64,
    used_size: u64,
    overhead: u64,
    free_chunks: u64,
    used_chunks: u64,
    allow_oom: bool,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("total", &self.total_size())
            .field("free", &self.free_size)
            .field("used", &self.used_size)
            .field("allow_oom", &self.allow_oom)
            .finish()
    }
}

impl Arena {
    /// Create an arena over a freshly allocated region of `size` bytes.
    ///
    /// The size is rounded down to the alignment. The region never grows.
    /// With `allow_oom` false, an allocation that cannot be satisfied panics
    /// instead of returning `None`.
    pub fn create(name: &str, size: u64, allow_oom: bool) -> Result<Self, ArenaError> {
        let total = size - size % ALIGNMENT;
        let min = CHUNK_OVERHEAD + MIN_ALLOC;
        if total < min {
            return Err(ArenaError::RegionTooSmall { size, min });
        }
        let len = usize::try_from(total).map_err(|_| ArenaError::RegionTooLarge { size })?;

        let mut arena = Arena {
            name: name.to_string(),
            region: vec![0u8; len].into_boxed_slice(),
            buckets: [NIL; BUCKET_COUNT],
            free_size: 0,
            used_size: 0,
            overhead: CHUNK_OVERHEAD,
            free_chunks: 0,
            used_chunks: 0,
            allow_oom,
        };

        arena.write_tags(TAG_SIZE, total - CHUNK_OVERHEAD, false);
        arena.link(TAG_SIZE);

        debug!(
            arena = %arena.name,
            total = total,
            allow_oom = allow_oom,
            "arena created"
        );
        Ok(arena)
    }

    /// Bytes an allocation of `size` consumes, tags included.
    pub fn required_size(size: u64) -> u64 {
        Self::payload_size(size) + CHUNK_OVERHEAD
    }

    /// Region size in bytes.
    pub fn total_size(&self) -> u64 {
        self.region.len() as u64
    }

    /// Largest single payload the empty arena could hold.
    pub fn capacity(&self) -> u64 {
        self.total_size() - CHUNK_OVERHEAD
    }

    /// Payload bytes currently free.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Payload bytes currently allocated.
    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    /// Name given at creation, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate at least `size` bytes.
    ///
    /// Returns `None` when no free chunk is large enough and the arena allows
    /// exhaustion.
    ///
    /// # Panics
    ///
    /// Panics on exhaustion when the arena was created with `allow_oom` false.
    pub fn malloc(&mut self, size: u64) -> Option<Chunk> {
        if size <= self.capacity() {
            let want = Self::payload_size(size);
            if let Some(payload) = self.find_free(want) {
                self.unlink(payload);
                let have = self.payload_size_at(payload);
                self.used_chunks += 1;
                self.used_size += have;
                self.write_tags(payload, have, true);
                self.shrink_used(payload, want);
                return Some(Chunk(payload));
            }
        }
        self.out_of_memory(size)
    }

    /// Resize an allocation, preserving its leading bytes.
    ///
    /// Shrinks in place, grows in place into a free right neighbour when
    /// possible, and otherwise moves the data. On `None` the original chunk is
    /// untouched and still owned by the caller.
    ///
    /// # Panics
    ///
    /// Panics when `chunk` is not a live allocation of this arena, or on
    /// exhaustion with `allow_oom` false.
    pub fn realloc(&mut self, chunk: Chunk, size: u64) -> Option<Chunk> {
        let have = self.checked_size(chunk);
        if size > self.capacity() {
            return self.out_of_memory(size);
        }

        let want = Self::payload_size(size);
        if want <= have {
            self.shrink_used(chunk.0, want);
            return Some(chunk);
        }

        if let Some(next_size) = self.next_free_size(chunk.0) {
            if have + CHUNK_OVERHEAD + next_size >= want {
                let merged = self.absorb_next_free(chunk.0);
                self.used_size += merged - have;
                self.write_tags(chunk.0, merged, true);
                self.shrink_used(chunk.0, want);
                return Some(chunk);
            }
        }

        let moved = self.malloc(size)?;
        let src = chunk.0 as usize;
        let dst = moved.0 as usize;
        self.region.copy_within(src..src + have as usize, dst);
        self.free(chunk);
        Some(moved)
    }

    /// Return a chunk to its bucket, coalescing with free neighbours.
    ///
    /// # Panics
    ///
    /// Panics when `chunk` lies outside the region or is not allocated.
    pub fn free(&mut self, chunk: Chunk) {
        let size = self.checked_size(chunk);
        self.used_chunks -= 1;
        self.used_size -= size;

        let mut payload = chunk.0;
        let mut size = size;

        if payload > TAG_SIZE {
            let prev_tag = self.read_u64(payload - 2 * TAG_SIZE);
            if !Self::tag_used(prev_tag) {
                let prev_size = Self::tag_size(prev_tag);
                let prev = payload - CHUNK_OVERHEAD - prev_size;
                self.unlink(prev);
                self.overhead -= CHUNK_OVERHEAD;
                size += prev_size + CHUNK_OVERHEAD;
                payload = prev;
            }
        }

        self.write_tags(payload, size, false);
        let merged = self.absorb_next_free(payload);
        self.write_tags(payload, merged, false);
        self.link(payload);
    }

    /// Check that `chunk` is a live allocation and return its payload size.
    pub fn validate(&self, chunk: Chunk) -> Result<u64, ArenaError> {
        let offset = chunk.0;
        let total = self.total_size();
        if offset < TAG_SIZE
            || offset % ALIGNMENT != 0
            || offset.saturating_add(MIN_ALLOC + TAG_SIZE) > total
        {
            return Err(ArenaError::OutOfBounds { offset, total });
        }

        let tag = self.read_u64(offset - TAG_SIZE);
        if !Self::tag_used(tag) {
            return Err(ArenaError::NotAllocated { offset });
        }

        let size = Self::tag_size(tag);
        if offset.saturating_add(size + TAG_SIZE) > total || self.read_u64(offset + size) != tag {
            return Err(ArenaError::CorruptTags { offset });
        }
        Ok(size)
    }

    /// Payload size of a live chunk (may exceed the requested size).
    pub fn chunk_size(&self, chunk: Chunk) -> u64 {
        self.payload_size_at(chunk.0)
    }

    /// Payload bytes of a chunk.
    pub fn bytes(&self, chunk: Chunk) -> &[u8] {
        let start = chunk.0 as usize;
        let len = self.payload_size_at(chunk.0) as usize;
        &self.region[start..start + len]
    }

    /// Mutable payload bytes of a chunk.
    pub fn bytes_mut(&mut self, chunk: Chunk) -> &mut [u8] {
        let start = chunk.0 as usize;
        let len = self.payload_size_at(chunk.0) as usize;
        &mut self.region[start..start + len]
    }

    /// Collect allocator statistics.
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats::empty(self.total_size());
        stats.free_size = self.free_size;
        stats.used_size = self.used_size;
        stats.overhead = self.overhead;
        stats.free_chunks = self.free_chunks;
        stats.used_chunks = self.used_chunks;

        let mut min = u64::MAX;
        let mut max = 0;
        for (index, head) in self.buckets.iter().enumerate() {
            let mut cur = *head;
            while cur != NIL {
                let size = self.payload_size_at(cur);
                min = min.min(size);
                max = max.max(size);
                stats.chunks_per_bucket[index] += 1;
                cur = self.read_u64(cur + TAG_SIZE);
            }
        }
        if max > 0 {
            stats.min_free_chunk = min;
            stats.max_free_chunk = max;
        }
        stats
    }

    fn payload_size(size: u64) -> u64 {
        (size.div_ceil(ALIGNMENT) * ALIGNMENT).max(MIN_ALLOC)
    }

    fn bucket_index(size: u64) -> usize {
        let index = (size - MIN_ALLOC) / ALIGNMENT;
        if index >= LARGE_BUCKET as u64 {
            LARGE_BUCKET
        } else {
            index as usize
        }
    }

    fn tag_size(tag: u64) -> u64 {
        tag & !USED_FLAG
    }

    fn tag_used(tag: u64) -> bool {
        tag & USED_FLAG != 0
    }

    fn read_u64(&self, at: u64) -> u64 {
        let at = at as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.region[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    fn write_u64(&mut self, at: u64, value: u64) {
        let at = at as usize;
        self.region[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_tags(&mut self, payload: u64, size: u64, used: bool) {
        let tag = if used { size | USED_FLAG } else { size };
        self.write_u64(payload - TAG_SIZE, tag);
        self.write_u64(payload + size, tag);
    }

    fn payload_size_at(&self, payload: u64) -> u64 {
        Self::tag_size(self.read_u64(payload - TAG_SIZE))
    }

    fn checked_size(&self, chunk: Chunk) -> u64 {
        match self.validate(chunk) {
            Ok(size) => size,
            Err(err) => {
                error!(arena = %self.name, error = %err, "invalid chunk handed back to arena");
                panic!("arena {}: {}", self.name, err);
            }
        }
    }

    fn out_of_memory(&self, size: u64) -> Option<Chunk> {
        if self.allow_oom {
            return None;
        }
        error!(
            arena = %self.name,
            requested = size,
            free = self.free_size,
            total = self.total_size(),
            "arena exhausted"
        );
        panic!(
            "arena {}: out of memory allocating {} bytes ({} of {} free)",
            self.name,
            size,
            self.free_size,
            self.total_size()
        );
    }

    fn link(&mut self, payload: u64) {
        let size = self.payload_size_at(payload);
        let index = Self::bucket_index(size);
        let head = self.buckets[index];

        self.write_u64(payload, NIL);
        self.write_u64(payload + TAG_SIZE, head);
        if head != NIL {
            self.write_u64(head, payload);
        }
        self.buckets[index] = payload;

        self.free_chunks += 1;
        self.free_size += size;
    }

    fn unlink(&mut self, payload: u64) {
        let size = self.payload_size_at(payload);
        let index = Self::bucket_index(size);
        let prev = self.read_u64(payload);
        let next = self.read_u64(payload + TAG_SIZE);

        if prev == NIL {
            self.buckets[index] = next;
        } else {
            self.write_u64(prev + TAG_SIZE, next);
        }
        if next != NIL {
            self.write_u64(next, prev);
        }

        self.free_chunks -= 1;
        self.free_size -= size;
    }

    fn find_free(&self, size: u64) -> Option<u64> {
        let index = Self::bucket_index(size);
        if index < LARGE_BUCKET {
            if let Some(head) = self.buckets[index..LARGE_BUCKET]
                .iter()
                .copied()
                .find(|head| *head != NIL)
            {
                return Some(head);
            }
        }
        self.best_fit(size)
    }

    fn best_fit(&self, size: u64) -> Option<u64> {
        let mut best: Option<(u64, u64)> = None;
        let mut cur = self.buckets[LARGE_BUCKET];
        while cur != NIL {
            let have = self.payload_size_at(cur);
            if have >= size && best.is_none_or(|(_, best_size)| have < best_size) {
                best = Some((cur, have));
                if have == size {
                    break;
                }
            }
            cur = self.read_u64(cur + TAG_SIZE);
        }
        best.map(|(payload, _)| payload)
    }

    /// Split the tail of a used chunk off into a free chunk when it is big
    /// enough to stand alone.
    fn shrink_used(&mut self, payload: u64, want: u64) {
        let have = self.payload_size_at(payload);
        if have - want < CHUNK_OVERHEAD + MIN_ALLOC {
            return;
        }

        let rest = payload + want + CHUNK_OVERHEAD;
        let rest_size = have - want - CHUNK_OVERHEAD;
        self.write_tags(payload, want, true);
        self.used_size -= have - want;
        self.overhead += CHUNK_OVERHEAD;

        self.write_tags(rest, rest_size, false);
        let merged = self.absorb_next_free(rest);
        self.write_tags(rest, merged, false);
        self.link(rest);
    }

    fn next_free_size(&self, payload: u64) -> Option<u64> {
        let size = self.payload_size_at(payload);
        let next_header = payload + size + TAG_SIZE;
        if next_header >= self.total_size() {
            return None;
        }
        let tag = self.read_u64(next_header);
        (!Self::tag_used(tag)).then(|| Self::tag_size(tag))
    }

    /// Unlink a free right neighbour and return the combined payload size.
    /// Tags are left for the caller to rewrite.
    fn absorb_next_free(&mut self, payload: u64) -> u64 {
        let size = self.payload_size_at(payload);
        match self.next_free_size(payload) {
            Some(next_size) => {
                let next = payload + size + CHUNK_OVERHEAD;
                self.unlink(next);
                self.overhead -= CHUNK_OVERHEAD;
                size + CHUNK_OVERHEAD + next_size
            }
            None => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_balanced(arena: &Arena) {
        let stats = arena.stats();
        assert_eq!(
            stats.free_size + stats.used_size + stats.overhead,
            stats.total_size,
            "free + used + overhead must equal total: {:?}",
            stats
        );
    }

    #[test]
    fn test_create_rejects_tiny_region() {
        let err = Arena::create("tiny", 16, true).unwrap_err();
        assert!(matches!(err, ArenaError::RegionTooSmall { .. }));
    }

    #[test]
    fn test_create_rounds_down_to_alignment() {
        let arena = Arena::create("odd", 1029, true).unwrap();
        assert_eq!(arena.total_size(), 1024);
        assert_eq!(arena.free_size(), 1024 - CHUNK_OVERHEAD);
        assert_balanced(&arena);
    }

    #[test]
    fn test_required_size_includes_tags() {
        assert_eq!(Arena::required_size(0), MIN_ALLOC + CHUNK_OVERHEAD);
        assert_eq!(Arena::required_size(1), MIN_ALLOC + CHUNK_OVERHEAD);
        assert_eq!(Arena::required_size(17), 24 + CHUNK_OVERHEAD);
        assert_eq!(Arena::required_size(100), 104 + CHUNK_OVERHEAD);
    }

    #[test]
    fn test_malloc_splits_and_accounts() {
        let mut arena = Arena::create("split", 1024, true).unwrap();
        let chunk = arena.malloc(100).unwrap();
        assert_eq!(arena.chunk_size(chunk), 104);
        assert_eq!(arena.used_size(), 104);
        assert_eq!(arena.free_size(), 1024 - 104 - 2 * CHUNK_OVERHEAD);
        assert_balanced(&arena);
    }

    #[test]
    fn test_free_restores_single_chunk() {
        let mut arena = Arena::create("restore", 4096, true).unwrap();
        let a = arena.malloc(40).unwrap();
        let b = arena.malloc(300).unwrap();
        let c = arena.malloc(24).unwrap();

        arena.free(b);
        arena.free(a);
        arena.free(c);

        let stats = arena.stats();
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.used_chunks, 0);
        assert_eq!(stats.free_size, 4096 - CHUNK_OVERHEAD);
        assert_balanced(&arena);
    }

    #[test]
    fn test_exact_bucket_is_reused() {
        let mut arena = Arena::create("reuse", 4096, true).unwrap();
        let a = arena.malloc(32).unwrap();
        let _guard = arena.malloc(32).unwrap();
        arena.free(a);

        let again = arena.malloc(30).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_large_allocations_best_fit() {
        let mut arena = Arena::create("best", 16 * 1024, true).unwrap();
        let big = arena.malloc(2000).unwrap();
        let _sep1 = arena.malloc(16).unwrap();
        let small = arena.malloc(600).unwrap();
        let _sep2 = arena.malloc(16).unwrap();

        arena.free(big);
        arena.free(small);

        // Both holes are in the large bucket; the tighter one wins.
        let fit = arena.malloc(560).unwrap();
        assert_eq!(fit, small);
        assert_balanced(&arena);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut arena = Arena::create("bytes", 1024, true).unwrap();
        let chunk = arena.malloc(5).unwrap();
        arena.bytes_mut(chunk)[..5].copy_from_slice(b"hello");
        assert_eq!(&arena.bytes(chunk)[..5], b"hello");
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        let mut arena = Arena::create("shrink", 4096, true).unwrap();
        let chunk = arena.malloc(512).unwrap();
        let shrunk = arena.realloc(chunk, 64).unwrap();
        assert_eq!(shrunk, chunk);
        assert_eq!(arena.chunk_size(shrunk), 64);
        assert_balanced(&arena);
    }

    #[test]
    fn test_realloc_grows_into_free_neighbour() {
        let mut arena = Arena::create("grow", 4096, true).unwrap();
        let chunk = arena.malloc(64).unwrap();
        arena.bytes_mut(chunk)[..4].copy_from_slice(b"keep");

        let grown = arena.realloc(chunk, 1024).unwrap();
        assert_eq!(grown, chunk);
        assert!(arena.chunk_size(grown) >= 1024);
        assert_eq!(&arena.bytes(grown)[..4], b"keep");
        assert_balanced(&arena);
    }

    #[test]
    fn test_realloc_moves_when_blocked() {
        let mut arena = Arena::create("move", 4096, true).unwrap();
        let chunk = arena.malloc(64).unwrap();
        let _blocker = arena.malloc(64).unwrap();
        arena.bytes_mut(chunk)[..4].copy_from_slice(b"data");

        let moved = arena.realloc(chunk, 512).unwrap();
        assert_ne!(moved, chunk);
        assert_eq!(&arena.bytes(moved)[..4], b"data");
        assert!(arena.validate(chunk).is_err());
        assert_balanced(&arena);
    }

    #[test]
    fn test_exhaustion_returns_none_when_allowed() {
        let mut arena = Arena::create("full", 256, true).unwrap();
        assert!(arena.malloc(arena.capacity() + 1).is_none());
        let all = arena.malloc(arena.capacity()).unwrap();
        assert!(arena.malloc(1).is_none());
        arena.free(all);
        assert!(arena.malloc(1).is_some());
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn test_exhaustion_panics_when_not_allowed() {
        let mut arena = Arena::create("strict", 256, false).unwrap();
        let _ = arena.malloc(4096);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_double_free_panics() {
        let mut arena = Arena::create("double", 1024, true).unwrap();
        let a = arena.malloc(32).unwrap();
        let _b = arena.malloc(32).unwrap();
        arena.free(a);
        arena.free(a);
    }

    #[test]
    #[should_panic(expected = "outside the region")]
    fn test_foreign_chunk_panics() {
        let mut arena = Arena::create("bounds", 1024, true).unwrap();
        arena.free(Chunk(1 << 20));
    }

    #[test]
    fn test_stats_buckets() {
        let mut arena = Arena::create("buckets", 8192, true).unwrap();
        let a = arena.malloc(16).unwrap();
        let _sep = arena.malloc(16).unwrap();
        arena.free(a);

        let stats = arena.stats();
        assert_eq!(stats.chunks_per_bucket.len(), BUCKET_COUNT);
        assert_eq!(stats.chunks_per_bucket[0], 1);
        assert_eq!(stats.chunks_per_bucket[LARGE_BUCKET], 1);
        assert_eq!(stats.min_free_chunk, 16);
        assert_eq!(stats.free_chunks, 2);
    }
}
