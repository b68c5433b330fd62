//! Content-defined chunking fallbacks: fixed-size tiling and a 64-byte
//! rolling-window hash (bup-style adler variant).

use super::Entry;

const WINDOW: usize = 64;
const CHAR_OFFSET: u32 = 31;

/// Tile the range into `chunk_max`-sized pieces.
pub fn fixed(chunk_max: usize, top: &Entry, cb: &mut dyn FnMut(Entry)) {
    let mut offset = top.offset;
    let mut remain = top.size;
    while remain > 0 {
        let size = chunk_max.min(remain);
        cb(Entry { offset, size, high_entropy: top.high_entropy, nest: false });
        offset += size;
        remain -= size;
    }
}

/// Split at rolling-hash boundaries, each piece in `[chunk_min, chunk_max]`
/// except a possibly-short tail.
pub fn rolling(
    data: &[u8],
    chunk_min: usize,
    chunk_max: usize,
    top: &Entry,
    cb: &mut dyn FnMut(Entry),
) {
    let mask = ((chunk_max.next_power_of_two() - 1) >> 1) as u32;
    let mut offset = top.offset;
    let mut remain = top.size;
    while remain > 0 {
        let window = &data[offset..offset + chunk_max.min(remain)];
        let size = split_point(window, mask, chunk_min);
        cb(Entry { offset, size, high_entropy: top.high_entropy, nest: false });
        offset += size;
        remain -= size;
    }
}

/// First position where the windowed sum hash matches `mask`, at least
/// `min_size` in; the whole slice if no boundary fires.
fn split_point(data: &[u8], mask: u32, min_size: usize) -> usize {
    if data.len() <= min_size {
        return data.len();
    }
    let mut s1 = (WINDOW as u32).wrapping_mul(CHAR_OFFSET);
    let mut s2 = (WINDOW as u32)
        .wrapping_mul(WINDOW as u32 - 1)
        .wrapping_mul(CHAR_OFFSET);
    let mut i = 0usize;
    while i < data.len() && i < WINDOW {
        let cur = data[i] as u32;
        i += 1;
        s1 = s1.wrapping_add(cur);
        s2 = s2.wrapping_add(s1).wrapping_sub((WINDOW as u32).wrapping_mul(CHAR_OFFSET));
    }
    while i < data.len() && i < min_size {
        let cur = data[i] as u32;
        let prev = data[i - WINDOW] as u32;
        i += 1;
        s1 = s1.wrapping_add(cur).wrapping_sub(prev);
        s2 = s2
            .wrapping_add(s1)
            .wrapping_sub((WINDOW as u32).wrapping_mul(prev.wrapping_add(CHAR_OFFSET)));
    }
    while i < data.len() {
        let cur = data[i] as u32;
        let prev = data[i - WINDOW] as u32;
        i += 1;
        s1 = s1.wrapping_add(cur).wrapping_sub(prev);
        s2 = s2
            .wrapping_add(s1)
            .wrapping_sub((WINDOW as u32).wrapping_mul(prev.wrapping_add(CHAR_OFFSET)));
        let hash = (s1 << 16) | (s2 & 0xFFFF);
        if hash & mask == mask {
            return i;
        }
    }
    i
}
