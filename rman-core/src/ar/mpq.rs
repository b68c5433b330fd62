//! MPQ recogniser: optional shunt record before the header, format versions
//! 0-2, one entry per block-table row with a file position.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC_HEADER: u32 = u32::from_le_bytes(*b"MPQ\x1A");
const MAGIC_SHUNT: u32 = u32::from_le_bytes(*b"MPQ\x1B");
const BLOCK_SIZE: usize = 16;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let Some(mut magic) = reader.read::<u32>() else { return Ok(None) };

    let mut shunts = 0;
    while magic == MAGIC_SHUNT {
        shunts += 1;
        ar_assert!(shunts <= 8);
        let userdata = match reader.read::<u32>() {
            Some(v) => v,
            None => return Err("shunt record truncated".to_string()),
        };
        let headerpos = match reader.read::<u32>() {
            Some(v) => v,
            None => return Err("shunt record truncated".to_string()),
        };
        ar_assert!(headerpos < userdata);
        ar_assert!(reader.seek(headerpos as usize));
        magic = match reader.read::<u32>() {
            Some(v) => v,
            None => return Err("shunted header truncated".to_string()),
        };
    }
    if magic != MAGIC_HEADER {
        return Ok(None);
    }

    ar_assert!(reader.skip(8)); // header_size, archive_size
    let format_version = match reader.read::<u16>() {
        Some(v) => v,
        None => return Ok(None),
    };
    if format_version > 2 {
        return Ok(None);
    }
    ar_assert!(reader.skip(2)); // block_size shift
    ar_assert!(reader.skip(4)); // hash_table_pos
    let block_table_pos = match reader.read::<u32>() {
        Some(v) => v as u64,
        None => return Err("MPQ header truncated".to_string()),
    };
    ar_assert!(reader.skip(4)); // hash_table_size
    let block_table_size = match reader.read::<u32>() {
        Some(v) => v as usize,
        None => return Err("MPQ header truncated".to_string()),
    };

    let mut block_table_pos = block_table_pos;
    let mut ext_block_table_pos = 0u64;
    if format_version > 1 {
        let ext_low = match reader.read::<u32>() {
            Some(v) => v as u64,
            None => return Err("MPQ extended header truncated".to_string()),
        };
        let ext_high = match reader.read::<u32>() {
            Some(v) => v as u64,
            None => return Err("MPQ extended header truncated".to_string()),
        };
        ar_assert!(reader.skip(2)); // hash_table_pos_high
        let block_high = match reader.read::<u16>() {
            Some(v) => v as u64,
            None => return Err("MPQ extended header truncated".to_string()),
        };
        block_table_pos |= block_high << 32;
        ext_block_table_pos = ext_low | (ext_high << 32);
    }

    ar_assert!(reader.seek(block_table_pos as usize));
    let mut blocks = Vec::with_capacity(block_table_size);
    for _ in 0..block_table_size {
        let filepos = match reader.read::<u32>() {
            Some(v) => v,
            None => return Err("block table truncated".to_string()),
        };
        let compressed_size = match reader.read::<u32>() {
            Some(v) => v,
            None => return Err("block table truncated".to_string()),
        };
        ar_assert!(reader.skip(8)); // uncompressed size, flags
        blocks.push((filepos, compressed_size));
    }

    let mut blocks_high = vec![0u16; blocks.len()];
    if ext_block_table_pos != 0 {
        ar_assert!(reader.seek(ext_block_table_pos as usize));
        match reader.read_n::<u16>(blocks.len()) {
            Some(v) => blocks_high = v,
            None => return Err("extended block table truncated".to_string()),
        }
    }

    let mut entries = Vec::with_capacity(blocks.len());
    for (i, (filepos, compressed_size)) in blocks.iter().enumerate() {
        let block_pos = *filepos as u64 | ((blocks_high[i] as u64) << 32);
        if block_pos == 0 {
            continue;
        }
        ar_assert!(reader.contains(block_pos as usize, *compressed_size as usize));
        entries.push(Entry {
            offset: top.offset + block_pos as usize,
            size: *compressed_size as usize,
            ..Default::default()
        });
    }
    Ok(Some(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Version-1 archive: 32-byte header, block table, payloads.
    fn build_mpq(blocks: &[(u32, u32)], total: usize) -> Vec<u8> {
        let block_table_pos = 32u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"MPQ\x1A");
        out.extend_from_slice(&32u32.to_le_bytes()); // header size
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // format version
        out.extend_from_slice(&3u16.to_le_bytes()); // block size shift
        out.extend_from_slice(&0u32.to_le_bytes()); // hash table pos
        out.extend_from_slice(&block_table_pos.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // hash table size
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for (filepos, size) in blocks {
            out.extend_from_slice(&filepos.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // flags
        }
        out.resize(total, 0x33);
        out
    }

    #[test]
    fn blocks_with_positions_become_entries() {
        let data = build_mpq(&[(128, 64), (0, 10), (256, 32)], 512);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        let entries = try_split(&data, &top).unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Entry { offset: 128, size: 64, ..Default::default() });
        assert_eq!(entries[1], Entry { offset: 256, size: 32, ..Default::default() });
    }

    #[test]
    fn shunt_redirects_to_the_real_header() {
        // Shunt at 0, header at 16, block table at 48; table positions stay
        // relative to the start of the input.
        let mut out = Vec::new();
        out.extend_from_slice(b"MPQ\x1B");
        out.extend_from_slice(&64u32.to_le_bytes()); // userdata size
        out.extend_from_slice(&16u32.to_le_bytes()); // header pos
        out.resize(16, 0);
        out.extend_from_slice(b"MPQ\x1A");
        out.extend_from_slice(&32u32.to_le_bytes()); // header size
        out.extend_from_slice(&512u32.to_le_bytes()); // archive size
        out.extend_from_slice(&1u16.to_le_bytes()); // format version
        out.extend_from_slice(&3u16.to_le_bytes()); // block size shift
        out.extend_from_slice(&0u32.to_le_bytes()); // hash table pos
        out.extend_from_slice(&48u32.to_le_bytes()); // block table pos
        out.extend_from_slice(&0u32.to_le_bytes()); // hash table size
        out.extend_from_slice(&1u32.to_le_bytes()); // block count
        out.extend_from_slice(&128u32.to_le_bytes()); // filepos
        out.extend_from_slice(&64u32.to_le_bytes()); // compressed size
        out.extend_from_slice(&64u32.to_le_bytes()); // uncompressed size
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.resize(512, 0x33);
        let top = Entry { offset: 0, size: out.len(), high_entropy: false, nest: true };
        let entries = try_split(&out, &top).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 128);
        assert_eq!(entries[0].size, 64);
    }

    #[test]
    fn format_version_3_is_not_claimed() {
        let mut data = build_mpq(&[(128, 64)], 512);
        data[12..14].copy_from_slice(&3u16.to_le_bytes());
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).unwrap().is_none());
    }

    #[test]
    fn block_past_eof_is_an_error() {
        let data = build_mpq(&[(1024, 64)], 512);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).is_err());
    }
}
