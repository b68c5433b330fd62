//! PE recogniser: one entry per section with a non-zero file size.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC_DOS: u16 = 0x5A4D;
const MAGIC_NT: u32 = 0x4550;
const DOS_HEADER_SIZE: usize = 62;
const SECTION_SIZE: usize = 40;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    if reader.remains() < DOS_HEADER_SIZE + 4 {
        return Ok(None);
    }
    let magic = reader.read::<u16>().unwrap();
    if magic != MAGIC_DOS {
        return Ok(None);
    }
    reader.skip(56); // DOS stub fields
    let nt_offset = reader.read::<u32>().unwrap() as usize;

    if !reader.seek(nt_offset) {
        return Ok(None);
    }
    let nt_magic = match reader.read::<u32>() {
        Some(v) => v,
        None => return Ok(None),
    };
    if nt_magic != MAGIC_NT {
        return Ok(None);
    }
    ar_assert!(reader.skip(2)); // machine
    let nsects = match reader.read::<u16>() {
        Some(v) => v as usize,
        None => return Err("COFF header truncated".to_string()),
    };
    ar_assert!(reader.skip(12)); // timestamp, symtab, symcount
    let optsize = match reader.read::<u16>() {
        Some(v) => v as usize,
        None => return Err("COFF header truncated".to_string()),
    };
    ar_assert!(reader.skip(2)); // characteristics
    ar_assert!(reader.skip(optsize));

    let mut entries = Vec::with_capacity(nsects);
    for _ in 0..nsects {
        let mut section = match reader.read_within(SECTION_SIZE) {
            Some(r) => r,
            None => return Err("section table truncated".to_string()),
        };
        section.skip(8); // name
        section.skip(8); // vmsize, vmaddr
        let filesize = section.read::<u32>().unwrap() as usize;
        let fileoff = section.read::<u32>().unwrap() as usize;
        if filesize == 0 {
            continue;
        }
        ar_assert!(reader.contains(fileoff, filesize));
        entries.push(Entry { offset: top.offset + fileoff, size: filesize, ..Default::default() });
    }
    Ok(Some(entries))
}
