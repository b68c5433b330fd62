//! FSB (versions 1-4) recogniser: header describes TOC and data region
//! sizes; per-sample data sizes are aligned up to 32 bytes.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const MAGIC: [u8; 3] = *b"FSB";

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    if top.size < 4 {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let magic: [u8; 3] = reader.read_array().unwrap();
    let version = reader.read::<u8>().unwrap();
    if magic != MAGIC {
        return Ok(None);
    }

    let desc_count;
    let toc_size;
    let data_size;
    let mut mode = 0u32;
    match version {
        b'1' => {
            desc_count = read_u32(&mut reader)? as usize;
            data_size = read_u32(&mut reader)? as usize;
            ar_assert!(reader.skip(4)); // zero
            toc_size = desc_count * 64;
        }
        b'2' => {
            desc_count = read_u32(&mut reader)? as usize;
            toc_size = read_u32(&mut reader)? as usize;
            data_size = read_u32(&mut reader)? as usize;
        }
        b'3' => {
            desc_count = read_u32(&mut reader)? as usize;
            toc_size = read_u32(&mut reader)? as usize;
            data_size = read_u32(&mut reader)? as usize;
            ar_assert!(reader.skip(4)); // version
            mode = read_u32(&mut reader)?;
        }
        b'4' => {
            desc_count = read_u32(&mut reader)? as usize;
            toc_size = read_u32(&mut reader)? as usize;
            data_size = read_u32(&mut reader)? as usize;
            ar_assert!(reader.skip(4)); // version
            mode = read_u32(&mut reader)?;
            ar_assert!(reader.skip(8)); // zero
            ar_assert!(reader.skip(16)); // hash
        }
        _ => return Ok(None),
    }
    ar_assert!(toc_size / 8 >= desc_count);

    let mut toc = match reader.read_within(toc_size) {
        Some(r) => r,
        None => return Err("FSB TOC exceeds the input".to_string()),
    };
    let mut data_offset = reader.offset();
    ar_assert!(data_offset % 32 == 0);
    ar_assert!(reader.remains() == data_size);

    let mut entries = Vec::with_capacity(desc_count);
    for _ in 0..desc_count {
        let sample_size;
        match version {
            b'1' => {
                ar_assert!(toc.skip(32)); // name
                ar_assert!(toc.skip(4)); // sample count
                sample_size = read_u32(&mut toc)? as usize;
                ar_assert!(toc.skip(64 - 40));
            }
            _ if mode & 2 == 0 => {
                let desc_var_size = match toc.read::<u16>() {
                    Some(v) => v as usize,
                    None => return Err("FSB TOC entry truncated".to_string()),
                };
                ar_assert!(toc.skip(30)); // name
                ar_assert!(toc.skip(4)); // sample count
                sample_size = read_u32(&mut toc)? as usize;
                ar_assert!(desc_var_size >= 40);
                ar_assert!(toc.skip(desc_var_size - 40));
            }
            _ => {
                ar_assert!(toc.skip(4)); // sample count
                sample_size = read_u32(&mut toc)? as usize;
            }
        }
        // Sample payloads are 32-byte aligned.
        let size = sample_size.div_ceil(32) * 32;
        ar_assert!(reader.contains(data_offset, size));
        entries.push(Entry {
            offset: top.offset + data_offset,
            size,
            high_entropy: true,
            nest: false,
        });
        data_offset += size;
    }
    ar_assert!(data_offset == top.size);
    Ok(Some(entries))
}

fn read_u32(r: &mut Reader) -> Result<u32, String> {
    r.read::<u32>().ok_or_else(|| "FSB header truncated".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// FSB3 with basic (non-variable) TOC entries: mode bit 1 set.
    fn build_fsb3(sample_sizes: &[u32]) -> Vec<u8> {
        let mut toc = Vec::new();
        let mut data = Vec::new();
        for s in sample_sizes {
            toc.extend_from_slice(&1u32.to_le_bytes()); // sample count
            toc.extend_from_slice(&s.to_le_bytes());
            let aligned = (*s as usize).div_ceil(32) * 32;
            data.extend(std::iter::repeat(0xEEu8).take(aligned));
        }
        let mut out = Vec::new();
        out.extend_from_slice(b"FSB3");
        out.extend_from_slice(&(sample_sizes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(toc.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // version
        out.extend_from_slice(&2u32.to_le_bytes()); // mode: basic headers
        // Pad the header + TOC to a 32-byte data boundary.
        out.extend_from_slice(&toc);
        while out.len() % 32 != 0 {
            out.push(0);
        }
        // Move the padding into the TOC size so offsets line up.
        let toc_total = out.len() - 24;
        out[8..12].copy_from_slice(&(toc_total as u32).to_le_bytes());
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn fsb3_samples_align_to_32() {
        let data = build_fsb3(&[40, 100]);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        let entries = try_split(&data, &top).unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, 64);
        assert_eq!(entries[1].size, 128);
        assert_eq!(entries[0].offset + 64, entries[1].offset);
        assert!(entries.iter().all(|e| e.high_entropy && !e.nest));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut data = build_fsb3(&[40]);
        data.extend_from_slice(&[0u8; 8]);
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).is_err());
    }

    #[test]
    fn other_magics_are_not_claimed() {
        let data = b"FSX3....".to_vec();
        let top = Entry { offset: 0, size: data.len(), high_entropy: false, nest: true };
        assert!(try_split(&data, &top).unwrap().is_none());
    }
}
