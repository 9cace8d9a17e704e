//! Byte-range planning for chunked transfers.

use super::models::ByteRange;

/// Splits an object of `content_length` bytes into contiguous inclusive ranges.
///
/// Unknown or empty objects, and objects below `min_bytes_for_chunking`, get a
/// single range covering everything. Larger objects are split into
/// `chunk_count` near-equal ranges, the last one absorbing the remainder.
pub fn plan(content_length: Option<u64>, chunk_count: u32, min_bytes_for_chunking: u64) -> Vec<ByteRange> {
    let len = match content_length {
        Some(len) if len > 0 => len,
        _ => return vec![ByteRange::open(0)],
    };

    if len < min_bytes_for_chunking {
        return vec![ByteRange::bounded(0, len - 1)];
    }

    // Never plan empty ranges for tiny objects with a low threshold
    let count = u64::from(chunk_count.max(1)).min(len);
    let size = len / count;

    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 { len - 1 } else { start + size - 1 };
            ByteRange::bounded(start, end)
        })
        .collect()
}
