//! WPK recogniser (`r3d2` magic): an indirect offset table pointing at
//! per-entry descriptors; all payloads are treated as high entropy.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC: [u8; 4] = *b"r3d2";
const TOC_START: usize = 12;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.offset != 0 || top.size < 8 {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let magic: [u8; 4] = reader.read_array().unwrap();
    let version = reader.read::<u32>().unwrap();
    if magic != MAGIC || version > 10 {
        return Ok(None);
    }
    if version != 1 {
        return Err(format!("unsupported WPK version {}", version));
    }

    ar_assert!(top.size >= TOC_START);
    let desc_count = reader.read::<u32>().unwrap() as usize;
    let toc_size = 4 * desc_count;
    ar_assert!(top.size - TOC_START >= toc_size);
    let toc_start = top.offset + TOC_START;

    let mut entries = Vec::with_capacity(desc_count + 1);
    entries.push(Entry { offset: toc_start, size: toc_size, ..Default::default() });

    for i in 0..desc_count {
        let mut slot = Reader::range(data, toc_start + 4 * i, 4).unwrap();
        let desc_offset = slot.read::<u32>().unwrap() as usize;
        ar_assert!(top.size >= desc_offset);
        ar_assert!(top.size - desc_offset >= 8);
        let desc_offset = top.offset + desc_offset;
        ar_assert!(desc_offset >= toc_start + toc_size);

        let mut desc = Reader::range(data, desc_offset, 8).unwrap();
        let offset = desc.read::<u32>().unwrap() as usize;
        let size = desc.read::<u32>().unwrap() as usize;

        let entry = Entry {
            offset: top.offset + offset,
            size,
            high_entropy: true,
            nest: false,
        };
        ar_assert!(entry.offset >= toc_start + toc_size);
        ar_assert!(top.size >= offset);
        ar_assert!(top.size - offset >= size);
        entries.push(entry);
    }
    Ok(Some(entries))
}
