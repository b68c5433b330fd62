//! Mach-O recognisers: FAT containers nest one entry per architecture;
//! executables emit one entry per segment, or per non-empty section when a
//! segment is big enough to be worth splitting.

use super::{ar_assert, Attempt, Entry};
use crate::reader::Reader;

const FAT_MAGIC: u32 = 0xCAFE_BABE;
const FAT_MAGIC_64: u32 = 0xCAFE_BABF;
const EXE_MAGIC: u32 = 0xFEED_FACE;
const EXE_MAGIC_64: u32 = 0xFEED_FACF;
const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;

pub(super) fn try_split_fat(data: &[u8], top: &Entry) -> Attempt {
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let (Some(magic), Some(narchs)) = (reader.read::<u32>(), reader.read::<u32>()) else {
        return Ok(None);
    };
    if (magic != FAT_MAGIC && magic != FAT_MAGIC_64) || narchs >= 43 {
        return Ok(None);
    }

    let mut entries = Vec::with_capacity(narchs as usize);
    for _ in 0..narchs {
        ar_assert!(reader.skip(8)); // cputype, cpusubtype
        let offset = match reader.read::<u64>() {
            Some(v) => v as usize,
            None => return Err("FAT arch table truncated".to_string()),
        };
        let size = match reader.read::<u64>() {
            Some(v) => v as usize,
            None => return Err("FAT arch table truncated".to_string()),
        };
        ar_assert!(reader.skip(8)); // align, reserved
        // Architectures live past the FAT header; an arch at offset 0 would
        // re-enter this recogniser forever.
        ar_assert!(offset >= 8);
        ar_assert!(reader.contains(offset, size));
        entries.push(Entry {
            offset: top.offset + offset,
            size,
            high_entropy: false,
            nest: true,
        });
    }
    Ok(Some(entries))
}

pub(super) fn try_split_exe(data: &[u8], top: &Entry, chunk_min: usize) -> Attempt {
    let Some(mut reader) = Reader::range(data, top.offset, top.size) else { return Ok(None) };
    let Some(magic) = reader.read::<u32>() else { return Ok(None) };
    if magic != EXE_MAGIC && magic != EXE_MAGIC_64 {
        return Ok(None);
    }
    // cputype, cpusubtype, filetype
    if !reader.skip(12) {
        return Ok(None);
    }
    let ncmds = match reader.read::<u32>() {
        Some(v) => v,
        None => return Ok(None),
    };
    let sizeofcmds = match reader.read::<u32>() {
        Some(v) => v as usize,
        None => return Ok(None),
    };
    ar_assert!(reader.skip(4)); // flags
    if magic == EXE_MAGIC_64 {
        ar_assert!(reader.skip(4)); // reserved
    }

    let mut cmds = match reader.read_within(sizeofcmds) {
        Some(r) => r,
        None => return Err("load commands exceed the input".to_string()),
    };
    ar_assert!(cmds.size() >= 8 * ncmds as usize);

    let mut entries = Vec::new();
    for _ in 0..ncmds {
        let cmd = match cmds.read::<u32>() {
            Some(v) => v,
            None => return Err("load command truncated".to_string()),
        };
        let cmd_size = match cmds.read::<u32>() {
            Some(v) => v as usize,
            None => return Err("load command truncated".to_string()),
        };
        ar_assert!(cmd_size >= 8);
        let mut body = match cmds.read_within(cmd_size - 8) {
            Some(r) => r,
            None => return Err("load command body truncated".to_string()),
        };

        if cmd != LC_SEGMENT && cmd != LC_SEGMENT_64 {
            continue;
        }
        let wide = cmd == LC_SEGMENT_64;
        ar_assert!(body.skip(16)); // segname
        let (fileoff, filesize, nsects) = if wide {
            ar_assert!(body.skip(16)); // vmaddr, vmsize
            let fileoff = read_u64(&mut body)? as usize;
            let filesize = read_u64(&mut body)? as usize;
            ar_assert!(body.skip(8)); // maxprot, initprot
            let nsects = read_u32(&mut body)?;
            ar_assert!(body.skip(4)); // flags
            (fileoff, filesize, nsects)
        } else {
            ar_assert!(body.skip(8)); // vmaddr, vmsize
            let fileoff = read_u32(&mut body)? as usize;
            let filesize = read_u32(&mut body)? as usize;
            ar_assert!(body.skip(8)); // maxprot, initprot
            let nsects = read_u32(&mut body)?;
            ar_assert!(body.skip(4)); // flags
            (fileoff, filesize, nsects)
        };
        if filesize == 0 {
            continue;
        }
        ar_assert!(reader.contains(fileoff, filesize));

        if filesize <= chunk_min || nsects == 0 {
            entries.push(Entry { offset: top.offset + fileoff, size: filesize, ..Default::default() });
            continue;
        }
        for _ in 0..nsects {
            ar_assert!(body.skip(32)); // sectname, segname
            let (size, offset) = if wide {
                ar_assert!(body.skip(8)); // addr
                let size = read_u64(&mut body)? as usize;
                let offset = read_u32(&mut body)? as usize;
                ar_assert!(body.skip(28)); // align..reserved3
                (size, offset)
            } else {
                ar_assert!(body.skip(4)); // addr
                let size = read_u32(&mut body)? as usize;
                let offset = read_u32(&mut body)? as usize;
                ar_assert!(body.skip(24)); // align..reserved2
                (size, offset)
            };
            if offset == 0 {
                continue;
            }
            ar_assert!(offset >= fileoff);
            ar_assert!(offset - fileoff <= filesize);
            ar_assert!(reader.contains(offset, size));
            entries.push(Entry { offset: top.offset + offset, size, ..Default::default() });
        }
    }
    Ok(Some(entries))
}

fn read_u32(r: &mut Reader) -> Result<u32, String> {
    r.read::<u32>().ok_or_else(|| "load command field truncated".to_string())
}

fn read_u64(r: &mut Reader) -> Result<u64, String> {
    r.read::<u64>().ok_or_else(|| "load command field truncated".to_string())
}
