//! BNK soundbank recogniser: 8-byte-header sections; the DIDX section
//! catalogs (offset, size) pairs into DATA, which become the entries.

use std::collections::BTreeMap;

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const BKHD: [u8; 4] = *b"BKHD";
const DIDX: [u8; 4] = *b"DIDX";
const DATA: [u8; 4] = *b"DATA";
const SECTION_HEADER: usize = 8;
const DIDX_ENTRY: usize = 12;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.size < SECTION_HEADER {
        return Ok(None);
    }
    let Some(reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    if data[top.offset..top.offset + 4] != BKHD {
        return Ok(None);
    }

    // Section map keyed by the 4-byte tag; offsets are absolute and point
    // past each section header.
    let mut sections: BTreeMap<[u8; 4], (usize, usize)> = BTreeMap::new();
    let mut cursor = reader;
    while cursor.remains() != 0 {
        ar_assert!(cursor.remains() >= SECTION_HEADER);
        let tag: [u8; 4] = cursor.read_array().unwrap();
        let size = cursor.read::<u32>().unwrap() as usize;
        ar_assert!(cursor.remains() >= size);
        sections.insert(tag, (top.offset + cursor.offset(), size));
        cursor.skip(size);
    }

    let mut entries = Vec::with_capacity(sections.len());
    let didx = sections.get(&DIDX).copied();
    let data_sec = sections.get(&DATA).copied();
    if let (Some((didx_off, didx_size)), Some((data_off, data_size))) = (didx, data_sec) {
        ar_assert!(didx_size % DIDX_ENTRY == 0);
        let mut catalog = Reader::range(data, didx_off, didx_size)
            .ok_or_else(|| "DIDX section out of bounds".to_string())?;
        for _ in 0..didx_size / DIDX_ENTRY {
            let _id = catalog.read::<u32>().unwrap();
            let offset = catalog.read::<u32>().unwrap() as usize;
            let size = catalog.read::<u32>().unwrap() as usize;
            ar_assert!(data_size >= offset);
            ar_assert!(data_size - offset >= size);
            entries.push(Entry {
                offset: data_off + offset,
                size,
                high_entropy: true,
                nest: false,
            });
        }
        // The cataloged payloads replace the DATA body; both section bodies
        // shrink to their headers below.
        sections.insert(DIDX, (didx_off, 0));
        sections.insert(DATA, (data_off, 0));
    }

    for (_, (offset, size)) in sections {
        entries.push(Entry {
            offset: offset - SECTION_HEADER,
            size: size + SECTION_HEADER,
            ..Default::default()
        });
    }
    Ok(Some(entries))
}
