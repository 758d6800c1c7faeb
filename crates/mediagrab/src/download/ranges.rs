/// Inclusive byte range `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    #[inline]
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Partition `[0, size)` into contiguous inclusive ranges of at most `chunk_size` bytes.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ByteRange> {
    if size == 0 {
        return Vec::new();
    }
    let chunk_size = if chunk_size == 0 { size } else { chunk_size };
    let count = size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            ByteRange {
                start,
                end: (start + chunk_size).min(size) - 1,
            }
        })
        .collect()
}

/// Number of chunk workers: bounded by the request, the machine and the work.
pub fn effective_concurrency(requested: usize, chunk_count: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    requested
        .min(cpus.saturating_sub(1))
        .min(chunk_count)
        .max(1)
}
