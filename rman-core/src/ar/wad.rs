//! WAD recogniser (`RW` magic, versions 1-3). The header layout switches on
//! the version byte; TOC entry type 0 is raw data and gets nested.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC: [u8; 2] = *b"RW";
const DESC_SIZE_MAX: usize = 32;

struct Header {
    desc_size: usize,
    desc_count: usize,
    toc_start: usize,
}

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.offset != 0 || top.size < 4 {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let magic: [u8; 2] = reader.read_array().unwrap();
    let version: [u8; 2] = reader.read_array().unwrap();
    if magic != MAGIC || version[0] > 10 {
        return Ok(None);
    }

    let header = match version[0] {
        0 | 1 => {
            // magic(2) version(2) toc_start(2) desc_size(2) desc_count(4)
            ar_assert!(top.size >= 12);
            let toc_start = reader.read::<u16>().unwrap() as usize;
            let desc_size = reader.read::<u16>().unwrap() as usize;
            let desc_count = reader.read::<u32>().unwrap() as usize;
            Header { desc_size, desc_count, toc_start }
        }
        2 => {
            // signature(84) + checksum(8) precede the TOC fields.
            ar_assert!(top.size >= 104);
            ar_assert!(reader.skip(84 + 8));
            let toc_start = reader.read::<u16>().unwrap() as usize;
            let desc_size = reader.read::<u16>().unwrap() as usize;
            let desc_count = reader.read::<u32>().unwrap() as usize;
            Header { desc_size, desc_count, toc_start }
        }
        3 => {
            // signature(256) + checksum(8); fixed TOC geometry.
            ar_assert!(top.size >= 272);
            ar_assert!(reader.skip(256 + 8));
            let desc_count = reader.read::<u32>().unwrap() as usize;
            Header { desc_size: 32, desc_count, toc_start: 272 }
        }
        _ => return Err(format!("unknown WAD version {}", version[0])),
    };

    ar_assert!(header.desc_size > 0 && header.desc_size <= DESC_SIZE_MAX);
    let toc_size = header.desc_size * header.desc_count;
    ar_assert!(top.size >= header.toc_start);
    ar_assert!(top.size - header.toc_start >= toc_size);
    let toc_start = top.offset + header.toc_start;

    let mut entries = Vec::with_capacity(header.desc_count + 1);
    entries.push(Entry { offset: toc_start, size: toc_size, ..Default::default() });

    for i in 0..header.desc_count {
        let mut raw = [0u8; DESC_SIZE_MAX];
        let pos = toc_start + i * header.desc_size;
        raw[..header.desc_size].copy_from_slice(&data[pos..pos + header.desc_size]);
        let mut desc = Reader::new(&raw);
        desc.skip(8); // path hash
        let offset = desc.read::<u32>().unwrap() as usize;
        let size_compressed = desc.read::<u32>().unwrap() as usize;
        let _size_uncompressed = desc.read::<u32>().unwrap();
        let kind = desc.read::<u8>().unwrap() & 0x0F;

        let entry = Entry {
            offset: top.offset + offset,
            size: size_compressed,
            high_entropy: kind > 2, // 0 = raw, 1 = zlib, 2 = link
            nest: kind == 0,
        };
        ar_assert!(entry.offset >= toc_start + toc_size);
        ar_assert!(top.size >= offset);
        ar_assert!(top.size - offset >= entry.size);
        entries.push(entry);
    }
    Ok(Some(entries))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ar::Ar;

    /// Build a v3 WAD: 272-byte header, then 32-byte descriptors.
    pub(crate) fn build_wad_v3(descs: &[(u32, u32, u8)], total_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; total_size];
        out[0] = b'R';
        out[1] = b'W';
        out[2] = 3;
        out[3] = 0;
        out[268..272].copy_from_slice(&(descs.len() as u32).to_le_bytes());
        for (i, (offset, size, kind)) in descs.iter().enumerate() {
            let pos = 272 + i * 32;
            out[pos + 8..pos + 12].copy_from_slice(&offset.to_le_bytes());
            out[pos + 12..pos + 16].copy_from_slice(&size.to_le_bytes());
            out[pos + 16..pos + 20].copy_from_slice(&size.to_le_bytes());
            out[pos + 20] = *kind;
        }
        out
    }

    #[test]
    fn v3_header_toc_and_raw_entry() {
        let data = build_wad_v3(&[(1024, 500, 0)], 2048);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        let entries = try_split(&data, &top).unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Entry { offset: 272, size: 32, ..Default::default() });
        assert_eq!(
            entries[1],
            Entry { offset: 1024, size: 500, high_entropy: false, nest: true }
        );
    }

    #[test]
    fn full_split_covers_header_toc_and_data() {
        let data = build_wad_v3(&[(1024, 500, 0)], 2048);
        let mut ar = Ar { chunk_max: 1 << 20, ..Default::default() };
        let mut entries = Vec::new();
        ar.split(&data, &mut |e| entries.push(e)).unwrap();
        let mut cur = 0usize;
        for e in &entries {
            assert_eq!(e.offset, cur);
            cur += e.size;
        }
        assert_eq!(cur, data.len());
        // Header leftover, TOC, gap, data entry, tail.
        assert!(entries.iter().any(|e| e.offset == 272 && e.size == 32));
        assert!(entries.iter().any(|e| e.offset == 1024 && e.size == 500));
        assert!(ar.errors.is_empty());
    }

    #[test]
    fn zlib_entries_are_not_nested() {
        let data = build_wad_v3(&[(304, 100, 1)], 500);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        let entries = try_split(&data, &top).unwrap().unwrap();
        assert!(!entries[1].nest);
        assert!(!entries[1].high_entropy);
    }

    #[test]
    fn entry_overlapping_toc_is_an_error() {
        let data = build_wad_v3(&[(100, 50, 0)], 1024);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).is_err());
    }

    #[test]
    fn future_versions_are_an_error_not_a_mismatch() {
        let mut data = build_wad_v3(&[], 512);
        data[2] = 7;
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).is_err());
        data[2] = 200; // implausible version byte: not a WAD at all
        assert!(try_split(&data, &top).unwrap().is_none());
    }
}
