use crate::WORD;

/// Header and footer overhead of a block, in bytes. Doubles as the size
/// granularity: every block size is a multiple of this, which keeps payloads
/// 8-byte aligned no matter how blocks are split and merged.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Minimum block size in bytes: header + footer + the two link words a free
/// block threads through its payload. Smaller requests are rounded up to
/// this floor, otherwise a freed block could not rejoin the free list.
pub(crate) const MIN_BLOCK: usize = 2 * OVERHEAD;

/// A block as it exists in the heap, decoded from its boundary tags. Blocks
/// are identified by the offset of their payload (`bp` throughout the crate)
/// and sized in total bytes, tags included. Here's what both states look like
/// in heap memory:
///
/// ```text
///         Allocated                      Free
///  +---------------------+    +---------------------+
///  | size | 1   (header) |    | size | 0   (header) |
///  +---------------------+    +---------------------+  <- bp
///  |                     |    | prev free block     |
///  |       payload       |    +---------------------+
///  |                     |    | next free block     |
///  |                     |    +---------------------+
///  |                     |    |      (unused)       |
///  +---------------------+    +---------------------+
///  | size | 1   (footer) |    | size | 0   (footer) |
///  +---------------------+    +---------------------+
/// ```
///
/// The footer mirrors the header exactly, so any block can find its
/// predecessor by reading the word right below its own header. The link
/// words exist only while the block is free; the moment it is handed out
/// they become payload, which is why the two states carry different fields
/// and why nothing in this crate reads links through an `Allocated` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Block {
    Allocated {
        size: usize,
    },
    Free {
        size: usize,
        prev: Option<usize>,
        next: Option<usize>,
    },
}

impl Block {
    /// Decodes the block whose payload starts at `bp`.
    pub fn load(heap: &[u8], bp: usize) -> Self {
        let (size, allocated) = unpack(load_word(heap, bp - WORD));

        if allocated {
            Block::Allocated { size }
        } else {
            Block::Free {
                size,
                prev: decode_link(load_word(heap, bp)),
                next: decode_link(load_word(heap, bp + WORD)),
            }
        }
    }

    /// Encodes this block at `bp`: header, footer and, for a free block, both
    /// link words. Everything a block states about itself goes through here,
    /// so header and footer can never disagree.
    pub fn store(&self, heap: &mut [u8], bp: usize) {
        debug_assert_eq!(bp % WORD, 0);

        let (size, allocated) = match *self {
            Block::Allocated { size } => (size, true),
            Block::Free { size, .. } => (size, false),
        };

        store_word(heap, bp - WORD, pack(size, allocated));
        store_word(heap, bp + size - OVERHEAD, pack(size, allocated));

        if let Block::Free { prev, next, .. } = *self {
            store_word(heap, bp, encode_link(prev));
            store_word(heap, bp + WORD, encode_link(next));
        }
    }

}

/// Packs a block size and its allocation state into one tag word. Sizes are
/// multiples of [`OVERHEAD`], so the low bits are free for the flag.
pub(crate) fn pack(size: usize, allocated: bool) -> u64 {
    debug_assert_eq!(size % OVERHEAD, 0);
    size as u64 | allocated as u64
}

/// Inverse of [`pack`].
pub(crate) fn unpack(word: u64) -> (usize, bool) {
    ((word & !(OVERHEAD as u64 - 1)) as usize, word & 1 == 1)
}

/// Reads the header tag of the block whose payload starts at `bp`.
pub(crate) fn header(heap: &[u8], bp: usize) -> (usize, bool) {
    unpack(load_word(heap, bp - WORD))
}

/// Reads the footer tag of the block immediately below `bp`. The prologue
/// sentinel guarantees this word exists for every real block.
pub(crate) fn prev_footer(heap: &[u8], bp: usize) -> (usize, bool) {
    unpack(load_word(heap, bp - OVERHEAD))
}

/// Payload offset of the block immediately above `bp`. The epilogue sentinel
/// guarantees the returned offset has a readable header.
pub(crate) fn next_block(heap: &[u8], bp: usize) -> usize {
    let (size, _) = header(heap, bp);
    bp + size
}

/// Payload offset of the block immediately below `bp`, found through its
/// footer.
pub(crate) fn prev_block(heap: &[u8], bp: usize) -> usize {
    let (size, _) = prev_footer(heap, bp);
    bp - size
}

/// Rounds a requested payload size up to a full block size: payload plus
/// tags, in [`OVERHEAD`] granularity, never below [`MIN_BLOCK`].
pub(crate) fn aligned_block_size(payload: usize) -> usize {
    if payload <= OVERHEAD {
        MIN_BLOCK
    } else {
        OVERHEAD * payload.div_ceil(OVERHEAD) + OVERHEAD
    }
}

pub(crate) fn load_word(heap: &[u8], offset: usize) -> u64 {
    debug_assert_eq!(offset % WORD, 0);
    let mut word = [0u8; WORD];
    word.copy_from_slice(&heap[offset..offset + WORD]);
    u64::from_ne_bytes(word)
}

pub(crate) fn store_word(heap: &mut [u8], offset: usize, word: u64) {
    debug_assert_eq!(offset % WORD, 0);
    heap[offset..offset + WORD].copy_from_slice(&word.to_ne_bytes());
}

// Free-list links are stored as payload offsets. Offset 0 is the alignment
// padding word and never a payload, so it encodes "no link".
fn encode_link(link: Option<usize>) -> u64 {
    link.map_or(0, |bp| bp as u64)
}

fn decode_link(word: u64) -> Option<usize> {
    (word != 0).then_some(word as usize)
}
