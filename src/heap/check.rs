//! The heap checker.
//!
//! [`Heap::check()`] validates every structural invariant the allocator
//! relies on, both along the physical block sequence and across the free
//! index. It exists for tests and debugging; the public operations never
//! call it.

use super::header::Header;
use super::index::{self, bucket_index, BUCKET_LIMIT, NIL};
use super::{Heap, FIRST_BLOCK, PROLOGUE};

use core::fmt;

/// A structural invariant violation found by [`Heap::check()`].
///
/// The `block` field is the word offset of the offending block (or link
/// target) within the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue sentinel is not a zero-sized allocated block.
    BadPrologue,
    /// The epilogue sentinel is not a zero-sized allocated block.
    BadEpilogue,
    /// A block header sits at an even word offset, so its payload would not
    /// be 8-aligned.
    Misaligned { block: u32 },
    /// A block size breaks the parity discipline (odd for allocated, even
    /// for free), is below the minimum or runs past the epilogue.
    BadBlockSize { block: u32 },
    /// A `prev free`-bit disagrees with the state of the physical
    /// predecessor.
    PrevFreeBitMismatch { block: u32 },
    /// A free block's footer is not a copy of its header.
    BoundaryTagMismatch { block: u32 },
    /// Two physically adjacent blocks are both free.
    AdjacentFreeBlocks { block: u32 },
    /// A free block in the heap does not appear in the index.
    NotIndexed { block: u32 },
    /// An index entry is out of bounds, misaligned or not a free block.
    BadIndexEntry { block: u32 },
    /// A bucket holds a block of a different size than the bucket's.
    WrongBucket { block: u32 },
    /// A sibling's `pred` link does not point back to its predecessor.
    BrokenSiblingLink { block: u32 },
    /// A sibling list is not strictly ascending in address or mixes sizes.
    MisorderedSiblings { block: u32 },
    /// A size-tree node violates the strict left < node < right ordering.
    MisorderedTree { block: u32 },
    /// The index walk visited more entries than the heap can hold.
    IndexCycle,
}

impl<const N: usize> Heap<N> {
    /// Validate the complete heap structure.
    ///
    /// Validates the index structures first, then walks the physical block
    /// sequence from prologue to epilogue, returning the first violation
    /// found. An uninitialized heap is trivially valid.
    ///
    /// The cross-check that the heap walk and the index walk see the same
    /// number of free blocks is a soft diagnostic: it asserts in debug
    /// builds and is never a [`CheckError`].
    pub fn check(&self) -> Result<(), CheckError> {
        if self.region.words() == 0 {
            return Ok(());
        }
        let epilogue = self.epilogue();

        if self.header(PROLOGUE) != Header::allocated(0) {
            return Err(CheckError::BadPrologue);
        }
        let free_in_index = self.check_index()?;

        let mut free_in_heap = 0_u32;
        let mut prev_was_free = false;
        let mut block = FIRST_BLOCK;
        while block != epilogue {
            let header = self.header(block);
            let size = header.size();

            if block % 2 == 0 {
                return Err(CheckError::Misaligned { block });
            }
            let (min, parity, end) = if header.is_free() {
                (2, 0, block + size + 2)
            } else {
                (3, 1, block + size + 1)
            };
            if size < min || size % 2 != parity || end > epilogue {
                return Err(CheckError::BadBlockSize { block });
            }
            if header.prev_free() != prev_was_free {
                return Err(CheckError::PrevFreeBitMismatch { block });
            }
            if header.is_free() {
                let footer = Header::from_bits(self.region.word(block + size + 1));
                if footer != header {
                    return Err(CheckError::BoundaryTagMismatch { block });
                }
                if prev_was_free {
                    return Err(CheckError::AdjacentFreeBlocks { block });
                }
                if !self.indexed(block) {
                    return Err(CheckError::NotIndexed { block });
                }
                free_in_heap += 1;
            }

            prev_was_free = header.is_free();
            block = self.next_block(block);
        }

        let end = self.header(epilogue);
        if end.size() != 0 || end.is_free() {
            return Err(CheckError::BadEpilogue);
        }
        if end.prev_free() != prev_was_free {
            return Err(CheckError::PrevFreeBitMismatch { block: epilogue });
        }

        if cfg!(debug_assertions) {
            assert_eq!(
                free_in_heap, free_in_index,
                "heap traversal and index disagree on the number of free blocks"
            );
        }
        Ok(())
    }

    /// Validate the buckets and the size tree; returns the entry count.
    fn check_index(&self) -> Result<u32, CheckError> {
        let mut count = 0_u32;

        for (bucket, &head) in self.index.buckets.iter().enumerate() {
            let expected = 2 + 2 * bucket as u32;
            let mut before = NIL;
            let mut block = head;
            while block != NIL {
                self.check_entry(block, &mut count)?;
                if self.header(block).size() != expected {
                    return Err(CheckError::WrongBucket { block });
                }
                if index::pred(&self.region, block) != before {
                    return Err(CheckError::BrokenSiblingLink { block });
                }
                before = block;
                block = index::succ(&self.region, block);
            }
        }

        self.check_tree(self.index.root, 0, u32::MAX, &mut count)?;
        Ok(count)
    }

    /// Validate the subtree rooted at `node`, whose sizes must lie strictly
    /// between `lower` and `upper`.
    fn check_tree(
        &self,
        node: u32,
        lower: u32,
        upper: u32,
        count: &mut u32,
    ) -> Result<(), CheckError> {
        if node == NIL {
            return Ok(());
        }
        self.check_entry(node, count)?;
        let size = self.header(node).size();
        if size <= BUCKET_LIMIT {
            return Err(CheckError::WrongBucket { block: node });
        }
        if size <= lower || size >= upper {
            return Err(CheckError::MisorderedTree { block: node });
        }
        if index::pred(&self.region, node) != NIL {
            return Err(CheckError::BrokenSiblingLink { block: node });
        }

        // the node heads a sibling list of equal size, ascending in address
        let mut before = node;
        let mut sibling = index::succ(&self.region, node);
        while sibling != NIL {
            self.check_entry(sibling, count)?;
            if self.header(sibling).size() != size || sibling <= before {
                return Err(CheckError::MisorderedSiblings { block: sibling });
            }
            if index::pred(&self.region, sibling) != before {
                return Err(CheckError::BrokenSiblingLink { block: sibling });
            }
            before = sibling;
            sibling = index::succ(&self.region, sibling);
        }

        self.check_tree(index::left(&self.region, node), lower, size, count)?;
        self.check_tree(index::right(&self.region, node), size, upper, count)
    }

    /// Validate a single index entry and count it. Catches stray links
    /// before anything dereferences the entry's words.
    fn check_entry(&self, block: u32, count: &mut u32) -> Result<(), CheckError> {
        let epilogue = self.epilogue();
        if block < FIRST_BLOCK || block >= epilogue || block % 2 == 0 {
            return Err(CheckError::BadIndexEntry { block });
        }
        let header = self.header(block);
        if header.is_allocated() || block + header.size() + 2 > epilogue {
            return Err(CheckError::BadIndexEntry { block });
        }
        *count += 1;
        if *count > self.region.words() {
            return Err(CheckError::IndexCycle);
        }
        Ok(())
    }

    /// Whether the free block at `block` can be found through the index.
    fn indexed(&self, block: u32) -> bool {
        let size = self.header(block).size();
        let mut steps = self.region.words();

        let mut node = if size <= BUCKET_LIMIT {
            self.index.buckets[bucket_index(size)]
        } else {
            // descend to the size class first
            let mut node = self.index.root;
            while node != NIL && steps > 0 {
                let node_size = self.header(node).size();
                if node_size == size {
                    break;
                }
                node = if size < node_size {
                    index::left(&self.region, node)
                } else {
                    index::right(&self.region, node)
                };
                steps -= 1;
            }
            node
        };

        while node != NIL && steps > 0 {
            if node == block {
                return true;
            }
            node = index::succ(&self.region, node);
            steps -= 1;
        }
        false
    }
}

impl<const N: usize> fmt::Debug for Heap<N> {
    /// Dump the physical block sequence, one entry per block.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.region.words() == 0 {
            return f.write_str("Heap(uninitialized)");
        }
        let epilogue = self.epilogue();
        let mut list = f.debug_list();
        let mut block = FIRST_BLOCK;
        while block < epilogue {
            let header = self.header(block);
            list.entry(&format_args!("{}: {:?}", block, header));
            block = self.next_block(block);
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Heap;
    use super::CheckError;
    use crate::heap::header::Header;

    #[test]
    fn fresh_and_used_heaps_check_clean() {
        let mut heap = Heap::<4096>::new();
        heap.check().unwrap();
        let first = heap.allocate(16).unwrap().as_ptr();
        let _second = heap.allocate(100).unwrap();
        heap.check().unwrap();
        heap.free(first);
        heap.check().unwrap();
    }

    #[test]
    fn detects_a_corrupt_prologue() {
        let mut heap = Heap::<4096>::new();
        let _keep = heap.allocate(16).unwrap();
        heap.region.set_word(0, Header::free(0).to_bits());
        assert_eq!(heap.check(), Err(CheckError::BadPrologue));
    }

    #[test]
    fn detects_a_corrupt_epilogue() {
        let mut heap = Heap::<4096>::new();
        let _keep = heap.allocate(16).unwrap();
        let epilogue = heap.epilogue();
        heap.region
            .set_word(epilogue, Header::allocated(2).to_bits());
        assert_eq!(heap.check(), Err(CheckError::BadEpilogue));
    }

    #[test]
    fn detects_a_torn_boundary_tag() {
        let mut heap = Heap::<4096>::new();
        let first = heap.allocate(16).unwrap().as_ptr();
        let _second = heap.allocate(16).unwrap();
        heap.free(first);

        // the freed block lives at offset 1 with size 4; tear its footer
        heap.region.set_word(6, Header::free(6).to_bits());
        assert_eq!(
            heap.check(),
            Err(CheckError::BoundaryTagMismatch { block: 1 })
        );
    }

    #[test]
    fn detects_a_stale_prev_free_bit() {
        let mut heap = Heap::<4096>::new();
        let first = heap.allocate(16).unwrap().as_ptr();
        let _second = heap.allocate(16).unwrap();
        heap.free(first);

        // the second block (offset 7) must carry the bit for its freed
        // predecessor; clear it
        heap.region.set_word(7, Header::allocated(5).to_bits());
        assert_eq!(
            heap.check(),
            Err(CheckError::PrevFreeBitMismatch { block: 7 })
        );
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut heap = Heap::<4096>::new();
        let _first = heap.allocate(16).unwrap();
        let _second = heap.allocate(16).unwrap();

        // hand-craft the second block (offset 7, size 4) into a free block
        // without coalescing it with the free tail at offset 13
        heap.shape_free(7, 4, false);
        heap.index.put(&mut heap.region, 7);
        let tail = Header::free(242).with_prev_free(true);
        heap.region.set_word(13, tail.to_bits());
        heap.region.set_word(256, tail.to_bits());
        assert_eq!(
            heap.check(),
            Err(CheckError::AdjacentFreeBlocks { block: 13 })
        );
    }

    #[test]
    fn detects_a_free_block_missing_from_the_index() {
        let mut heap = Heap::<4096>::new();
        let first = heap.allocate(16).unwrap().as_ptr();
        let _second = heap.allocate(16).unwrap();
        heap.free(first);

        heap.index.take(&mut heap.region, 1);
        assert_eq!(heap.check(), Err(CheckError::NotIndexed { block: 1 }));
    }

    #[test]
    fn detects_a_stray_tree_link() {
        let mut heap = Heap::<4096>::new();
        let first = heap.allocate(64).unwrap().as_ptr();
        let _guard = heap.allocate(16).unwrap();
        heap.free(first);

        // the freed block (offset 1, size 16) is a tree leaf; point its
        // left child at an even offset
        heap.region.set_word(1 + 3, 8);
        assert_eq!(heap.check(), Err(CheckError::BadIndexEntry { block: 8 }));
    }

    #[test]
    fn detects_a_misordered_tree() {
        let mut heap = Heap::<4096>::new();
        let first = heap.allocate(64).unwrap().as_ptr();
        let _gap1 = heap.allocate(16).unwrap();
        let second = heap.allocate(100).unwrap().as_ptr();
        let _gap2 = heap.allocate(16).unwrap();
        heap.free(first);
        heap.free(second);
        heap.check().unwrap();

        // size 24 (offset 25) hangs to the right of size 16 (offset 1);
        // hang it off the left side instead
        heap.region.set_word(1 + 3, 25);
        heap.region.set_word(1 + 4, 0);
        assert_eq!(heap.check(), Err(CheckError::MisorderedTree { block: 25 }));
    }
}
