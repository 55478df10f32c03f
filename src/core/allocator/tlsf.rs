/// Free chunk of a memory block, as tracked by the TLSF index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeChunk {
    /// Index of the block the chunk lives in.
    pub block: usize,
    /// Offset of the chunk within the block.
    pub offset: u64,
    /// Size of the chunk in bytes.
    pub size: u64,
}

impl FreeChunk {
    /// Whether an allocation of `size` bytes fits in the chunk
    /// once its start has been aligned.
    pub fn fits(&self, size: u64, alignment: u64) -> bool {
        let start = super::memory::align_up(self.offset, alignment);
        start.checked_add(size)
            .is_some_and(|end| end <= self.offset + self.size)
    }
}

type FreeList = Vec<FreeChunk>;

/// Number of first level bins: one per power of two a `u64`
/// size can have, so that no chunk ever falls out of range.
const FL_BIN_COUNT: usize = 64;

/// Number of second level bins. We use a single byte for the
/// bitmap, so there are 8 bins, each corresponding to a range
/// 2^f(1 + n/8), where f is the first level index and n the
/// second level bin.
const SL_BIN_COUNT: usize = 8;

/// Two-level segregated fit index of the free chunks of a set of
/// memory blocks.
pub struct Tlsf {
    first_level: u64,
    second_level: [u8; FL_BIN_COUNT],
    free_lists: [[FreeList; SL_BIN_COUNT]; FL_BIN_COUNT],
}

impl Default for Tlsf {
    fn default() -> Self {
        Self {
            first_level: 0,
            second_level: [0; FL_BIN_COUNT],
            free_lists: std::array::from_fn(|_| Default::default()),
        }
    }
}

impl Tlsf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.first_level == 0
    }

    pub fn insert(&mut self, chunk: FreeChunk) {
        // Get the first and second level indices for this
        // chunk, flag both bins as non-empty and file the chunk
        // in the corresponding free list.
        let (fl, sl) = indices(chunk.size);
        self.first_level |= 1 << fl;
        self.second_level[fl] |= 1 << sl;
        self.free_lists[fl][sl].push(chunk);
    }

    /// Removes a chunk that is about to be merged with a
    /// neighbour. Returns false if it was not indexed.
    pub fn remove(&mut self, chunk: FreeChunk) -> bool {
        let (fl, sl) = indices(chunk.size);
        match self.free_lists[fl][sl].iter().position(|c| *c == chunk) {
            Some(position) => {
                self.take(fl, sl, position);
                true
            }
            None => false,
        }
    }

    /// Takes a free chunk able to hold `size` bytes at the
    /// given alignment out of the index.
    pub fn find(&mut self, size: u64, alignment: u64) -> Option<FreeChunk> {
        // The bin holding `size` itself also holds chunks that
        // are slightly smaller, so its list has to be searched.
        // Every bin above it only holds chunks large enough, and
        // only the alignment padding can make one of them fail;
        // in practice the first chunk of the first non-empty
        // bin is taken, which is what makes this a good fit
        // rather than a best fit.
        let (mut fl, sl) = indices(size.max(1));
        let mut sl_map = self.second_level[fl] & (u8::MAX << sl);

        loop {
            while sl_map != 0 {
                let bin = sl_map.trailing_zeros() as usize;
                let found = self.free_lists[fl][bin]
                    .iter()
                    .position(|chunk| chunk.fits(size, alignment));

                if let Some(position) = found {
                    return Some(self.take(fl, bin, position));
                }

                // Clear the lowest set bit and try the next bin.
                sl_map &= sl_map - 1;
            }

            // Move on to the next non-empty first level bin.
            let above = match fl + 1 {
                next if next < FL_BIN_COUNT => self.first_level & (u64::MAX << next),
                _ => 0,
            };
            if above == 0 {
                return None;
            }

            fl = above.trailing_zeros() as usize;
            sl_map = self.second_level[fl];
        }
    }

    fn take(&mut self, fl: usize, sl: usize, position: usize) -> FreeChunk {
        let list = &mut self.free_lists[fl][sl];
        let chunk = list.swap_remove(position);

        // Keep the bitmaps in sync with the lists, so that empty
        // bins are skipped without looking at them.
        if list.is_empty() {
            self.second_level[fl] &= !(1 << sl);
            if self.second_level[fl] == 0 {
                self.first_level &= !(1 << fl);
            }
        }

        chunk
    }
}

/// First and second level bins of a chunk of `size` bytes.
fn indices(size: u64) -> (usize, usize) {
    // For a given chunk of size s, the first level
    // "superblock" it will be placed in is the one with size
    // 2^n <= s, so n = floor(log2(s)).
    let fl = size.ilog2() as usize;

    // The second level splits [2^f, 2^(f+1)) in 8 equal parts,
    // so the bin is given by the 3 bits right below the leading
    // one. Sizes under 8 bytes have fewer bits than that and
    // are shifted up instead.
    let sl = if fl >= 3 {
        (size >> (fl - 3)) & 0b111
    } else {
        (size << (3 - fl)) & 0b111
    };

    (fl, sl as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(block: usize, offset: u64, size: u64) -> FreeChunk {
        FreeChunk { block, offset, size }
    }

    #[test]
    fn bins_split_powers_of_two_in_eighths() {
        assert_eq!(indices(1), (0, 0));
        assert_eq!(indices(5), (2, 2));
        assert_eq!(indices(256), (8, 0));
        assert_eq!(indices(256 + 32), (8, 1));
        assert_eq!(indices(511), (8, 7));
        assert_eq!(indices(u64::MAX), (63, 7));
    }

    #[test]
    fn find_skips_chunks_that_are_too_small() {
        let mut tlsf = Tlsf::new();
        tlsf.insert(chunk(0, 0, 300));
        tlsf.insert(chunk(0, 1000, 290));

        assert_eq!(tlsf.find(295, 1), Some(chunk(0, 0, 300)));
        assert_eq!(tlsf.find(295, 1), None);
        assert!(!tlsf.is_empty());
    }

    #[test]
    fn find_moves_up_to_larger_bins() {
        let mut tlsf = Tlsf::new();
        tlsf.insert(chunk(1, 0, 1 << 20));

        assert_eq!(tlsf.find(64, 16), Some(chunk(1, 0, 1 << 20)));
        assert!(tlsf.is_empty());
    }

    #[test]
    fn alignment_padding_counts_against_the_chunk() {
        let mut tlsf = Tlsf::new();
        tlsf.insert(chunk(0, 8, 256));

        // Aligning 8 up to 256 leaves only 8 bytes.
        assert_eq!(tlsf.find(16, 256), None);
        assert_eq!(tlsf.find(16, 8), Some(chunk(0, 8, 256)));
    }

    #[test]
    fn removed_chunks_are_no_longer_found() {
        let mut tlsf = Tlsf::new();
        tlsf.insert(chunk(0, 0, 128));
        tlsf.insert(chunk(0, 512, 128));

        assert!(tlsf.remove(chunk(0, 0, 128)));
        assert!(!tlsf.remove(chunk(0, 0, 128)));
        assert_eq!(tlsf.find(128, 1), Some(chunk(0, 512, 128)));
        assert!(tlsf.is_empty());
    }
}
