//! Internal `r3d2load` archive recogniser: a fixed header points at a TOC of
//! file descriptors; each file's data region is nested.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC: [u8; 8] = *b"r3d2load";
const HEADER_SIZE: usize = 32;
const DESC_SIZE: usize = 40;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.size < HEADER_SIZE {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let magic: [u8; 8] = reader.read_array().unwrap();
    if magic != MAGIC {
        return Ok(None);
    }
    reader.skip(8); // version, size
    reader.skip(4); // data offset
    let toc_offset = reader.read::<u32>().unwrap() as usize;
    let file_count = reader.read::<u32>().unwrap() as usize;
    ar_assert!(reader.seek(toc_offset));

    let mut entries = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let mut desc = match reader.read_within(DESC_SIZE) {
            Some(r) => r,
            None => return Err("load TOC truncated".to_string()),
        };
        desc.skip(8); // type tag, name hash
        let size = desc.read::<u32>().unwrap() as usize;
        let size2 = desc.read::<u32>().unwrap() as usize;
        let zero = desc.read::<u32>().unwrap();
        let data_offset = desc.read::<u32>().unwrap() as usize;
        let name_offset = desc.read::<u32>().unwrap() as usize;
        let name_size = desc.read::<u32>().unwrap() as usize;

        ar_assert!(zero == 0);
        ar_assert!(data_offset != 0);
        ar_assert!(size == size2);
        ar_assert!(reader.contains(data_offset, size));
        ar_assert!(reader.contains(name_offset, name_size));
        entries.push(Entry {
            offset: top.offset + data_offset,
            size,
            high_entropy: false,
            nest: true,
        });
    }
    Ok(Some(entries))
}
