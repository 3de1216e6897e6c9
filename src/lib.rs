//! Explicit free-list heap allocator with boundary tags.
//!
//! One [`Tagalloc`] instance manages one contiguous, growable heap held as
//! an owned byte buffer and addressed by offsets. Every block carries its
//! size and allocation state in a header word and a mirrored footer word,
//! free blocks additionally thread a doubly-linked list through their own
//! payload space, and adjacent free blocks are merged the moment they
//! appear. Placement is best-fit; resizing absorbs the neighboring free
//! block in place before it resorts to moving data.
//!
//! The heap bytes come from a [`HeapSource`], the crate's stand-in for a
//! program-break style growth primitive. [`BoundedHeap`] is the bundled
//! source: a buffer with a hard byte limit, which is also how out-of-memory
//! is produced deterministically.
//!
//! ```rust
//! use tagalloc::Tagalloc;
//!
//! let mut heap = Tagalloc::with_capacity(64 * 1024).unwrap();
//!
//! let ptr = heap.allocate(40).unwrap();
//! assert_eq!(ptr % 8, 0);
//! assert!(heap.usable_size(ptr) >= 40);
//!
//! heap.deallocate(ptr);
//! ```

mod allocator;
mod block;
mod freelist;
mod source;

use std::fmt;

/// Width of a heap word in bytes. Boundary tags and free-list links are one
/// word each.
pub(crate) const WORD: usize = size_of::<u64>();

/// The heap source could not supply the requested bytes.
///
/// Only [`Tagalloc::bootstrap`] surfaces this as an error value; during
/// allocation and resizing, exhaustion is reported as `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap source exhausted")
    }
}

impl std::error::Error for AllocError {}

pub use allocator::Tagalloc;
pub use source::{BoundedHeap, HeapSource};
