//! Fixed-block memory pools.
//!
//! Bucketed pools for 16/32/64/128/256/512-byte blocks back the
//! small, fixed-size allocations of a VM state (object member arrays,
//! closure environments). Anything larger falls through to the host
//! allocator, tagged so `free` can identify it. Each pool keeps a list
//! of buckets; a bucket joins the pool's available list when it gains
//! its first free block and leaves it when it runs dry. Empty buckets
//! are retained for reuse.

use rustc_hash::FxHashMap;

/// Block byte sizes of the six pools.
const POOL_SIZES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Blocks per bucket.
const BLOCKS_PER_BUCKET: usize = 64;

/// Pool index tag for oversize allocations.
const LARGE_POOL: u8 = 0xFF;

/// Opaque reference to one allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    pool: u8,
    bucket: u16,
    slot: u32,
}

/// Allocation statistics, comparable before and after a lifecycle to
/// prove balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixMemStats {
    /// Total successful allocations.
    pub alloc_calls: u64,
    /// Total frees.
    pub free_calls: u64,
    /// Blocks currently live.
    pub live_blocks: u64,
    /// Bytes currently live (block-granular).
    pub live_bytes: u64,
}

struct Bucket {
    data: Vec<u32>,
    free: Vec<u16>,
}

impl Bucket {
    fn new(block_words: usize) -> Self {
        Self {
            data: vec![0; block_words * BLOCKS_PER_BUCKET],
            free: (0..BLOCKS_PER_BUCKET as u16).rev().collect(),
        }
    }
}

struct Pool {
    block_words: usize,
    buckets: Vec<Bucket>,
    /// Buckets that currently have at least one free block.
    avail: Vec<u16>,
}

impl Pool {
    fn new(block_bytes: usize) -> Self {
        Self {
            block_words: block_bytes / 4,
            buckets: Vec::new(),
            avail: Vec::new(),
        }
    }
}

/// The bucketed fixed-block allocator of one VM state.
///
/// Not safe for cross-state sharing; every state owns its own.
pub struct FixedAlloc {
    pools: [Pool; 6],
    large: FxHashMap<u32, Vec<u32>>,
    next_large: u32,
    stats: FixMemStats,
}

impl Default for FixedAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedAlloc {
    /// Empty pools.
    pub fn new() -> Self {
        Self {
            pools: POOL_SIZES.map(Pool::new),
            large: FxHashMap::default(),
            next_large: 0,
            stats: FixMemStats::default(),
        }
    }

    /// Allocate a zeroed block of at least `words` 32-bit words.
    pub fn alloc_words(&mut self, words: usize) -> BlockId {
        let bytes = words.max(1) * 4;
        self.stats.alloc_calls += 1;
        self.stats.live_blocks += 1;

        if let Some(pool_idx) = POOL_SIZES.iter().position(|&s| bytes <= s) {
            self.stats.live_bytes += POOL_SIZES[pool_idx] as u64;
            let pool = &mut self.pools[pool_idx];
            let bucket_idx = match pool.avail.last() {
                Some(&b) => b,
                None => {
                    let b = pool.buckets.len() as u16;
                    pool.buckets.push(Bucket::new(pool.block_words));
                    pool.avail.push(b);
                    b
                }
            };
            let bucket = &mut pool.buckets[bucket_idx as usize];
            let slot = bucket.free.pop().expect("available bucket has a free block");
            if bucket.free.is_empty() {
                pool.avail.retain(|&b| b != bucket_idx);
            }
            let base = slot as usize * pool.block_words;
            bucket.data[base..base + pool.block_words].fill(0);
            BlockId {
                pool: pool_idx as u8,
                bucket: bucket_idx,
                slot: slot as u32,
            }
        } else {
            // Oversize: the host allocator carries it; the LARGE tag in
            // the id is what identifies it on free.
            self.stats.live_bytes += bytes as u64;
            let key = self.next_large;
            self.next_large = self.next_large.wrapping_add(1);
            self.large.insert(key, vec![0; words]);
            BlockId {
                pool: LARGE_POOL,
                bucket: 0,
                slot: key,
            }
        }
    }

    /// Read a block's words.
    pub fn words(&self, id: BlockId) -> &[u32] {
        if id.pool == LARGE_POOL {
            return &self.large[&id.slot];
        }
        let pool = &self.pools[id.pool as usize];
        let bucket = &pool.buckets[id.bucket as usize];
        let base = id.slot as usize * pool.block_words;
        &bucket.data[base..base + pool.block_words]
    }

    /// Mutate a block's words.
    pub fn words_mut(&mut self, id: BlockId) -> &mut [u32] {
        if id.pool == LARGE_POOL {
            return self.large.get_mut(&id.slot).expect("live large block");
        }
        let pool = &mut self.pools[id.pool as usize];
        let bucket = &mut pool.buckets[id.bucket as usize];
        let base = id.slot as usize * pool.block_words;
        &mut bucket.data[base..base + pool.block_words]
    }

    /// Return a block to its pool.
    pub fn free(&mut self, id: BlockId) {
        self.stats.free_calls += 1;
        self.stats.live_blocks -= 1;
        if id.pool == LARGE_POOL {
            let block = self.large.remove(&id.slot).expect("double free of large block");
            self.stats.live_bytes -= (block.len() * 4) as u64;
            return;
        }
        self.stats.live_bytes -= POOL_SIZES[id.pool as usize] as u64;
        let pool = &mut self.pools[id.pool as usize];
        let bucket = &mut pool.buckets[id.bucket as usize];
        let was_dry = bucket.free.is_empty();
        bucket.free.push(id.slot as u16);
        if was_dry {
            pool.avail.push(id.bucket);
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> FixMemStats {
        self.stats
    }

    /// Blocks still live, per pool size. Non-empty at teardown means a
    /// leak; the debug build logs it.
    pub fn leak_report(&self) -> Vec<(usize, u64)> {
        let mut report = Vec::new();
        for (i, pool) in self.pools.iter().enumerate() {
            let free: usize = pool.buckets.iter().map(|b| b.free.len()).sum();
            let total = pool.buckets.len() * BLOCKS_PER_BUCKET;
            let live = (total - free) as u64;
            if live > 0 {
                report.push((POOL_SIZES[i], live));
            }
        }
        if !self.large.is_empty() {
            report.push((usize::MAX, self.large.len() as u64));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_balance() {
        let mut alloc = FixedAlloc::new();
        let entry = alloc.stats();
        let a = alloc.alloc_words(2);
        let b = alloc.alloc_words(30);
        alloc.free(a);
        alloc.free(b);
        let after = alloc.stats();
        assert_eq!(after.live_blocks, entry.live_blocks);
        assert_eq!(after.live_bytes, entry.live_bytes);
        assert_eq!(after.alloc_calls, entry.alloc_calls + 2);
        assert_eq!(after.free_calls, entry.free_calls + 2);
        assert!(alloc.leak_report().is_empty());
    }

    #[test]
    fn test_blocks_are_zeroed_and_writable() {
        let mut alloc = FixedAlloc::new();
        let id = alloc.alloc_words(4);
        assert!(alloc.words(id).iter().all(|&w| w == 0));
        alloc.words_mut(id)[2] = 0xDEAD;
        assert_eq!(alloc.words(id)[2], 0xDEAD);
        alloc.free(id);
        // Reuse hands the block back zeroed.
        let id2 = alloc.alloc_words(4);
        assert!(alloc.words(id2).iter().all(|&w| w == 0));
        alloc.free(id2);
    }

    #[test]
    fn test_bucket_growth_and_relink() {
        let mut alloc = FixedAlloc::new();
        // Exhaust the first bucket plus one.
        let ids: Vec<BlockId> = (0..BLOCKS_PER_BUCKET + 1)
            .map(|_| alloc.alloc_words(1))
            .collect();
        assert!(alloc.pools[0].buckets.len() >= 2);
        // Freeing a block from the full bucket relinks it.
        alloc.free(ids[0]);
        let reused = alloc.alloc_words(1);
        assert_eq!(reused, ids[0]);
        alloc.free(reused);
        for &id in &ids[1..] {
            alloc.free(id);
        }
        assert!(alloc.leak_report().is_empty());
    }

    #[test]
    fn test_oversize_falls_through() {
        let mut alloc = FixedAlloc::new();
        let big = alloc.alloc_words(200); // 800 bytes > 512
        assert_eq!(alloc.words(big).len(), 200);
        alloc.words_mut(big)[199] = 7;
        assert_eq!(alloc.words(big)[199], 7);
        alloc.free(big);
        assert!(alloc.leak_report().is_empty());
    }

    #[test]
    fn test_leak_report_names_live_blocks() {
        let mut alloc = FixedAlloc::new();
        let id = alloc.alloc_words(1);
        let report = alloc.leak_report();
        assert_eq!(report, vec![(16, 1)]);
        alloc.free(id);
    }
}
