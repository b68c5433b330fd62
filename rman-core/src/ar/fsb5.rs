//! FSB5 recogniser: packed 64-bit sample descriptors carry data offsets in
//! 16-byte units; offsets are unordered on disk and must be sorted.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC: [u8; 4] = *b"FSB5";

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.size < 4 {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let magic: [u8; 4] = reader.read_array().unwrap();
    if magic != MAGIC {
        return Ok(None);
    }

    ar_assert!(reader.skip(4)); // version
    let desc_count = read_u32(&mut reader)? as usize;
    let toc_size = read_u32(&mut reader)? as usize;
    let strings_size = read_u32(&mut reader)? as usize;
    let data_size = read_u32(&mut reader)? as usize;
    let _mode = read_u32(&mut reader)?;
    ar_assert!(reader.skip(8)); // zero
    ar_assert!(reader.skip(16)); // hash
    ar_assert!(reader.skip(8)); // dummy
    ar_assert!(toc_size / 8 >= desc_count);

    let mut toc = match reader.read_within(toc_size) {
        Some(r) => r,
        None => return Err("FSB5 TOC exceeds the input".to_string()),
    };
    ar_assert!(reader.skip(strings_size));
    ar_assert!(reader.offset() % 32 == 0);
    ar_assert!(reader.remains() == data_size);
    let data_start = top.offset + reader.offset();

    let mut offsets = Vec::with_capacity(desc_count);
    for _ in 0..desc_count {
        let packed = match toc.read::<u64>() {
            Some(v) => v,
            None => return Err("FSB5 TOC entry truncated".to_string()),
        };
        // Chained extra headers flagged in bit 0.
        let mut extra = packed & 1;
        while extra & 1 != 0 {
            extra = match toc.read::<u32>() {
                Some(v) => v as u64,
                None => return Err("FSB5 extra header truncated".to_string()),
            };
            let extra_size = ((extra >> 1) & 0xFF_FFFF) as usize;
            ar_assert!(toc.skip(extra_size));
        }
        let offset = (((packed >> 6) & 0xFFF_FFFF) * 16) as usize;
        ar_assert!(offset <= data_size);
        offsets.push(offset);
    }
    offsets.sort_unstable();

    // Each sample runs to the next one's offset; walk back from the end.
    let mut entries = vec![Entry::default(); desc_count];
    let mut last_offset = data_size;
    for i in (0..desc_count).rev() {
        let offset = offsets[i];
        entries[i] = Entry {
            offset: data_start + offset,
            size: last_offset - offset,
            high_entropy: true,
            nest: false,
        };
        last_offset = offset;
    }
    ar_assert!(last_offset == data_size || last_offset == 0);
    Ok(Some(entries))
}

fn read_u32(r: &mut Reader) -> Result<u32, String> {
    r.read::<u32>().ok_or_else(|| "FSB5 header truncated".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_SIZE: usize = 60;

    fn build_fsb5(offsets_16: &[u64], data_size: usize) -> Vec<u8> {
        let toc: Vec<u8> = offsets_16
            .iter()
            .flat_map(|o| ((o << 6) as u64).to_le_bytes())
            .collect();
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&1u32.to_le_bytes()); // version
        out.extend_from_slice(&(offsets_16.len() as u32).to_le_bytes());
        out.extend_from_slice(&(toc.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // strings
        out.extend_from_slice(&(data_size as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // mode
        out.extend_from_slice(&[0u8; 32]); // zero + hash + dummy
        assert_eq!(out.len(), HEADER_SIZE);
        out.extend_from_slice(&toc);
        // Strings are empty; pad the data region start to 32 bytes.
        let pad = (32 - out.len() % 32) % 32;
        let toc_total = toc.len() + pad;
        out[12..16].copy_from_slice(&(toc_total as u32).to_le_bytes());
        out.extend(std::iter::repeat(0u8).take(pad));
        out.extend(std::iter::repeat(0xABu8).take(data_size));
        out
    }

    #[test]
    fn unordered_offsets_are_sorted_and_sized_by_neighbor() {
        // Samples at 32 and 0 bytes into the data region (units of 16).
        let data = build_fsb5(&[2, 0], 128);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        let entries = try_split(&data, &top).unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, 32);
        assert_eq!(entries[1].size, 96);
        assert_eq!(entries[0].offset + 32, entries[1].offset);
        assert!(entries.iter().all(|e| e.high_entropy));
    }

    #[test]
    fn offset_past_data_region_is_an_error() {
        let data = build_fsb5(&[100], 128);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).is_err());
    }

    #[test]
    fn non_fsb5_is_not_claimed() {
        let data = vec![0u8; 64];
        let top = Entry { offset: 0, size: 64, high_entropy: false, nest: true };
        assert!(try_split(&data, &top).unwrap().is_none());
    }
}
