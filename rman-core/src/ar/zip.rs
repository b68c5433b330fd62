//! ZIP recogniser: data offsets come from the central directory; stored
//! (method 0) members are nested, anything else is high-entropy.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const LOCAL_SIG: u32 = 0x04034B50;
const CENTRAL_SIG: u32 = 0x02014B50;
const EOCD_SIG: u32 = 0x06054B50;
const LOCAL_HEADER_SIZE: usize = 30;
const EOCD_SIZE: usize = 22;

pub(super) fn try_split(data: &[u8], top: &Entry) -> Attempt {
    // Only whole files are considered for zip splitting.
    if top.offset != 0 || top.size != data.len() || top.size < EOCD_SIZE {
        return Ok(None);
    }
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    match reader.read::<u32>() {
        Some(sig) if sig == LOCAL_SIG || sig == CENTRAL_SIG => {}
        _ => return Ok(None),
    }

    let Some(eocd_pos) = find_eocd(data) else {
        return Err("central directory end record not found".to_string());
    };
    let mut eocd = Reader::range(data, eocd_pos, data.len() - eocd_pos).unwrap();
    eocd.skip(4);
    ar_assert!(eocd.skip(2)); // disk number
    ar_assert!(eocd.skip(2)); // central directory disk
    ar_assert!(eocd.skip(2)); // entries on this disk
    let total_entries = match eocd.read::<u16>() {
        Some(v) => v as usize,
        None => return Err("truncated end record".to_string()),
    };
    ar_assert!(eocd.skip(4)); // central directory size
    let cd_offset = match eocd.read::<u32>() {
        Some(v) => v as usize,
        None => return Err("truncated end record".to_string()),
    };
    ar_assert!(reader.contains(cd_offset, 0));

    let mut cd = Reader::range(data, cd_offset, data.len() - cd_offset)
        .ok_or_else(|| "central directory offset out of bounds".to_string())?;
    let mut entries = Vec::with_capacity(total_entries);
    for _ in 0..total_entries {
        let sig = cd.read::<u32>();
        ar_assert!(sig == Some(CENTRAL_SIG));
        ar_assert!(cd.skip(6)); // versions, flags
        let method = cd.read::<u16>();
        ar_assert!(cd.skip(8)); // mtime, mdate, crc32
        let comp_size = cd.read::<u32>();
        ar_assert!(cd.skip(4)); // uncompressed size
        let name_len = cd.read::<u16>();
        let extra_len = cd.read::<u16>();
        let comment_len = cd.read::<u16>();
        ar_assert!(cd.skip(8)); // disk start, internal/external attributes
        let local_off = cd.read::<u32>();
        let (Some(method), Some(comp_size), Some(name_len), Some(extra_len), Some(comment_len)) =
            (method, comp_size, name_len, extra_len, comment_len)
        else {
            return Err("truncated central directory entry".to_string());
        };
        let Some(local_off) = local_off else {
            return Err("truncated central directory entry".to_string());
        };
        ar_assert!(cd.skip(name_len as usize + extra_len as usize + comment_len as usize));

        // The data offset needs the local header's own name/extra lengths.
        let mut local = Reader::range(data, local_off as usize, LOCAL_HEADER_SIZE)
            .ok_or_else(|| "local header out of bounds".to_string())?;
        ar_assert!(local.read::<u32>() == Some(LOCAL_SIG));
        local.skip(22);
        let lname = local.read::<u16>().unwrap() as usize;
        let lextra = local.read::<u16>().unwrap() as usize;
        let data_off = local_off as usize + LOCAL_HEADER_SIZE + lname + lextra;
        ar_assert!(reader.contains(data_off, comp_size as usize));

        entries.push(Entry {
            offset: top.offset + data_off,
            size: comp_size as usize,
            high_entropy: method != 0,
            nest: method == 0,
        });
    }
    Ok(Some(entries))
}

/// Scan back from end-of-file for the end-of-central-directory record; the
/// trailing comment makes the position variable.
fn find_eocd(data: &[u8]) -> Option<usize> {
    let lo = data.len().saturating_sub(EOCD_SIZE + u16::MAX as usize);
    (lo..=data.len() - EOCD_SIZE).rev().find(|&pos| {
        u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) == EOCD_SIG
    })
}
