use log::{debug, trace};

use crate::{
    AllocError, WORD,
    block::{self, Block, MIN_BLOCK, OVERHEAD, aligned_block_size, pack, store_word},
    freelist::FreeList,
    source::{BoundedHeap, HeapSource},
};

/// Growth quantum in bytes. Misses smaller than this still grow the heap by
/// a full chunk so tiny allocations don't trigger a growth each.
pub(crate) const CHUNK: usize = 4096;

/// Explicit free-list allocator with boundary tags, managing one contiguous
/// heap obtained from a [`HeapSource`].
///
/// The heap is addressed by byte offsets. [`allocate`](Self::allocate)
/// returns the offset of a payload whose bytes are reached through
/// [`payload`](Self::payload) and [`payload_mut`](Self::payload_mut); the
/// offset stays valid until the block is deallocated or relocated by
/// [`resize`](Self::resize), regardless of how the heap grows in between.
///
/// The heap looks like this at all times:
///
/// ```text
///  +---------+----------+----------+-------+-------+-----+-------+----------+
///  | padding | prologue | prologue | block | block | ... | block | epilogue |
///  |  word   |  header  |  footer  |       |       |     |       |  header  |
///  +---------+----------+----------+-------+-------+-----+-------+----------+
///  0         8          16         24                          top-8      top
/// ```
///
/// The prologue and epilogue are permanently-allocated sentinels, so every
/// real block has a readable neighbor tag on both sides and merging never
/// has to special-case the ends of the heap.
///
/// Not thread safe and not reentrant; wrap an instance in whatever
/// synchronization the surrounding program needs. One instance per heap,
/// any number of instances per process.
///
/// # Examples
///
/// ```rust
/// use tagalloc::Tagalloc;
///
/// let mut heap = Tagalloc::with_capacity(64 * 1024).unwrap();
///
/// let ptr = heap.allocate(256).unwrap();
/// heap.payload_mut(ptr)[..5].copy_from_slice(b"hello");
/// assert_eq!(&heap.payload(ptr)[..5], b"hello");
///
/// let ptr = heap.resize(Some(ptr), 512).unwrap();
/// assert_eq!(&heap.payload(ptr)[..5], b"hello");
///
/// heap.deallocate(ptr);
/// ```
pub struct Tagalloc<S: HeapSource = BoundedHeap> {
    source: S,
    /// Free blocks, most recently freed or grown at the head.
    free: FreeList,
    /// Offset of the first real block's payload, anchor for heap walks.
    base: usize,
}

impl Tagalloc<BoundedHeap> {
    /// Bootstraps an allocator over a [`BoundedHeap`] that may grow up to
    /// `limit` bytes. The limit must cover the sentinels plus one growth
    /// chunk, about 4 KiB, or bootstrap reports exhaustion.
    pub fn with_capacity(limit: usize) -> Result<Self, AllocError> {
        Self::bootstrap(BoundedHeap::with_limit(limit))
    }
}

impl<S: HeapSource> Tagalloc<S> {
    /// Bootstraps an allocator over `source`: lays down the padding word and
    /// the prologue/epilogue sentinels, then performs the initial chunk
    /// growth. The source must be fresh; the allocator owns it from here on.
    ///
    /// Fails if the source cannot supply the sentinels plus one chunk, in
    /// which case no allocator exists at all; there is no partially
    /// initialized state to misuse.
    pub fn bootstrap(mut source: S) -> Result<Self, AllocError> {
        debug_assert!(source.is_empty(), "bootstrap requires a fresh source");

        source.grow(2 * OVERHEAD).ok_or(AllocError)?;

        let heap = source.bytes_mut();
        store_word(heap, 0, 0);
        Block::Allocated { size: OVERHEAD }.store(heap, OVERHEAD);
        store_word(heap, 3 * WORD, pack(0, true));

        let mut this = Self {
            source,
            free: FreeList::new(),
            base: 2 * OVERHEAD,
        };

        this.extend(CHUNK / WORD).ok_or(AllocError)?;
        debug!("heap bootstrapped, {} bytes", this.source.len());

        Ok(this)
    }

    /// Allocates a block with at least `size` usable bytes and returns its
    /// payload offset, 8-byte aligned. Returns `None` for `size == 0` (no
    /// heap mutation) and on out-of-memory; the two are indistinguishable
    /// here, callers that care pass a nonzero size.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }

        let block_size = aligned_block_size(size);

        let bp = match self.find_fit(block_size) {
            Some(bp) => bp,
            None => {
                let growth = block_size.max(CHUNK);
                let Some(bp) = self.extend(growth / WORD) else {
                    debug!("out of memory allocating {size} bytes");
                    return None;
                };
                bp
            }
        };

        self.place(bp, block_size);
        self.validate();

        Some(bp)
    }

    /// Returns the block at `bp` to the free list, merging with any free
    /// neighbor immediately.
    ///
    /// `bp` must be an offset previously returned by
    /// [`allocate`](Self::allocate) or [`resize`](Self::resize) and not
    /// freed since. Release builds trust the caller; debug builds assert.
    /// Either way a bad offset stays inside this allocator's own buffer.
    pub fn deallocate(&mut self, bp: usize) {
        let heap = self.source.bytes_mut();
        let (size, allocated) = block::header(heap, bp);
        debug_assert!(allocated, "deallocate on a block that is not allocated");

        Block::Free {
            size,
            prev: None,
            next: None,
        }
        .store(heap, bp);

        let merged = self.coalesce(bp);
        trace!("freed block at {bp}, free block at {merged} after merging");

        self.validate();
    }

    /// Resizes the block at `ptr` to hold at least `size` bytes, preserving
    /// its contents up to the smaller of the old and new sizes.
    ///
    /// `None` as `ptr` degenerates to [`allocate`](Self::allocate); zero as
    /// `size` degenerates to [`deallocate`](Self::deallocate) and returns
    /// `None`. A block that already fits is returned unchanged; one that can
    /// absorb the free block right above it grows in place without copying.
    /// Otherwise the contents move to a fresh block and the old one is
    /// freed. If that fresh allocation fails, `None` is returned and the
    /// original block remains fully intact.
    pub fn resize(&mut self, ptr: Option<usize>, size: usize) -> Option<usize> {
        let Some(bp) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            self.deallocate(bp);
            return None;
        }

        let (old_size, allocated) = block::header(self.source.bytes(), bp);
        debug_assert!(allocated, "resize on a block that is not allocated");

        let block_size = aligned_block_size(size);
        if block_size <= old_size {
            return Some(bp);
        }

        let next = bp + old_size;
        let (next_size, next_allocated) = block::header(self.source.bytes(), next);

        if !next_allocated && old_size + next_size >= block_size {
            let heap = self.source.bytes_mut();
            self.free.remove(heap, next);
            Block::Allocated {
                size: old_size + next_size,
            }
            .store(heap, bp);

            trace!("grew block at {bp} in place to {} bytes", old_size + next_size);
            self.validate();
            return Some(bp);
        }

        let new_bp = self.allocate(size)?;
        let copy = size.min(old_size - OVERHEAD);
        self.source.bytes_mut().copy_within(bp..bp + copy, new_bp);
        self.deallocate(bp);

        trace!("moved block at {bp} to {new_bp}, copied {copy} bytes");
        Some(new_bp)
    }

    /// Usable bytes of the allocated block at `bp`. At least the size it was
    /// requested with, possibly more.
    pub fn usable_size(&self, bp: usize) -> usize {
        let (size, allocated) = block::header(self.source.bytes(), bp);
        debug_assert!(allocated, "usable_size on a block that is not allocated");
        size - OVERHEAD
    }

    /// The payload bytes of the allocated block at `bp`.
    pub fn payload(&self, bp: usize) -> &[u8] {
        &self.source.bytes()[bp..bp + self.usable_size(bp)]
    }

    /// Mutable payload bytes of the allocated block at `bp`.
    pub fn payload_mut(&mut self, bp: usize) -> &mut [u8] {
        let usable = self.usable_size(bp);
        &mut self.source.bytes_mut()[bp..bp + usable]
    }

    /// Current heap length in bytes, sentinels included.
    pub fn heap_size(&self) -> usize {
        self.source.len()
    }

    /// Number of blocks currently on the free list.
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Bytes currently held in free blocks, boundary tags included.
    pub fn free_bytes(&self) -> usize {
        self.free.iter(self.source.bytes()).map(|(_, size)| size).sum()
    }

    /// Extends the heap by `words` 8-byte words, rounded up to keep the size
    /// granularity, and formats the new bytes as one free block where the
    /// old epilogue sat. The block is merged with a free block right below
    /// it, so two consecutive growths never leave two adjacent free blocks.
    /// Returns the merged block, or `None` when the source is exhausted.
    fn extend(&mut self, words: usize) -> Option<usize> {
        let size = words.div_ceil(2) * OVERHEAD;
        let bp = self.source.grow(size)?;

        debug!("heap grown by {size} bytes to {}", self.source.len());

        let heap = self.source.bytes_mut();
        Block::Free {
            size,
            prev: None,
            next: None,
        }
        .store(heap, bp);
        store_word(heap, bp + size - WORD, pack(0, true));

        Some(self.coalesce(bp))
    }

    /// Merges the free block at `bp` with free neighbors on either side.
    /// Each absorbed neighbor leaves the free list before its link words are
    /// clobbered; the merged result is pushed once at the end. Returns the
    /// merged block's payload offset.
    fn coalesce(&mut self, mut bp: usize) -> usize {
        let heap = self.source.bytes_mut();

        let (mut size, _) = block::header(heap, bp);
        let (prev_size, prev_allocated) = block::prev_footer(heap, bp);

        let next = bp + size;
        let (next_size, next_allocated) = block::header(heap, next);

        if !next_allocated {
            self.free.remove(heap, next);
            size += next_size;
        }

        if !prev_allocated {
            bp = block::prev_block(heap, bp);
            self.free.remove(heap, bp);
            size += prev_size;
        }

        self.free.push(heap, bp, size);
        bp
    }

    /// Best-fit search: the smallest free block that still holds `size`
    /// bytes, scanning the whole list with an early exit on an exact match.
    fn find_fit(&self, size: usize) -> Option<usize> {
        let heap = self.source.bytes();
        let mut best: Option<(usize, usize)> = None;

        for (bp, candidate) in self.free.iter(heap) {
            if candidate < size {
                continue;
            }

            if best.is_none_or(|(_, best_size)| candidate < best_size) {
                best = Some((bp, candidate));
                if candidate == size {
                    break;
                }
            }
        }

        best.map(|(bp, _)| bp)
    }

    /// Carves an allocated block of `size` bytes out of the free block at
    /// `bp`. The remainder becomes a new free block when it can stand on its
    /// own; otherwise the whole candidate is handed out and the surplus is
    /// internal fragmentation.
    fn place(&mut self, bp: usize, size: usize) {
        let heap = self.source.bytes_mut();
        let (candidate_size, _) = block::header(heap, bp);

        self.free.remove(heap, bp);

        let leftover = candidate_size - size;
        if leftover >= MIN_BLOCK {
            Block::Allocated { size }.store(heap, bp);
            self.free.push(heap, bp + size, leftover);
            trace!("split block at {bp}: {size} bytes placed, {leftover} kept free");
        } else {
            Block::Allocated {
                size: candidate_size,
            }
            .store(heap, bp);
        }
    }

    /// Full-heap invariant walk, debug builds only. Checks that boundary
    /// tags agree, that no two free blocks are adjacent, and that the free
    /// list and the free tags describe the same set of blocks.
    fn validate(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let heap = self.source.bytes();
        let mut bp = self.base;
        let mut free_blocks = 0;
        let mut previous_free = false;

        loop {
            let (size, allocated) = block::header(heap, bp);

            if size == 0 {
                assert!(allocated, "epilogue tag lost its allocated bit");
                assert_eq!(bp, heap.len(), "epilogue is not at the top of the heap");
                break;
            }

            assert_eq!(bp % WORD, 0, "misaligned payload at {bp}");
            assert!(
                size >= MIN_BLOCK && size % OVERHEAD == 0,
                "bad block size {size} at {bp}"
            );
            assert_eq!(
                block::unpack(block::load_word(heap, bp + size - OVERHEAD)),
                (size, allocated),
                "boundary tags disagree at {bp}"
            );

            if !allocated {
                assert!(!previous_free, "unmerged adjacent free blocks at {bp}");
                free_blocks += 1;
            }
            previous_free = !allocated;

            bp = block::next_block(heap, bp);
        }

        assert_eq!(free_blocks, self.free.len(), "free list length out of sync");

        let mut reached = 0;
        let mut expected_prev = None;
        for (bp, _) in self.free.iter(heap) {
            let Block::Free { prev, .. } = Block::load(heap, bp) else {
                panic!("allocated block at {bp} on the free list");
            };

            assert_eq!(prev, expected_prev, "broken prev link at {bp}");
            expected_prev = Some(bp);

            reached += 1;
            assert!(reached <= free_blocks, "cycle in the free list");
        }
        assert_eq!(reached, free_blocks, "free list misses free blocks");
    }
}
