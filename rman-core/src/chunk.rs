//! Chunk identity: opaque 64-bit ids, hash types, and the three chunk shapes
//! (descriptor, source location, file destination).

use sha2::{Digest, Sha256, Sha512};

/// Largest uncompressed chunk any manifest or bundle may carry.
pub const CHUNK_LIMIT: u32 = 16 * 1024 * 1024 - 1;

macro_rules! id64 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const NONE: Self = Self(0);

            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }

            pub fn is_none(self) -> bool {
                self.0 == 0
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                if s.is_empty() || s.len() > 16 {
                    return None;
                }
                u64::from_str_radix(s, 16).ok().map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:016X}", self.0)
            }
        }
    };
}

id64!(
    /// Identifies a bundle; also used by the cache as a file sequence index.
    BundleId
);
id64!(
    /// Content address of a chunk: the first 8 bytes of its hash.
    ChunkId
);
id64!(FileId);
id64!(ManifestId);

/// One-byte language id from the manifest language table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LangId(pub u8);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HashType {
    #[default]
    None = 0,
    Sha512 = 1,
    Sha256 = 2,
    RitoHkdf = 3,
}

impl HashType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Sha512),
            2 => Some(Self::Sha256),
            3 => Some(Self::RitoHkdf),
            _ => None,
        }
    }
}

/// Chunk descriptor as stored in a bundle TOC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

/// Descriptor plus where the compressed bytes live.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkSrc {
    pub chunk: Chunk,
    pub bundle_id: BundleId,
    pub compressed_offset: u64,
}

impl ChunkSrc {
    pub fn id(&self) -> ChunkId {
        self.chunk.id
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.chunk.uncompressed_size
    }

    pub fn compressed_size(&self) -> u32 {
        self.chunk.compressed_size
    }
}

/// Source plus where the decoded bytes land inside a specific file.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkDst {
    pub src: ChunkSrc,
    pub hash_type: HashType,
    pub uncompressed_offset: u64,
}

impl ChunkDst {
    pub fn id(&self) -> ChunkId {
        self.src.chunk.id
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.src.chunk.uncompressed_size
    }

    pub fn compressed_size(&self) -> u32 {
        self.src.chunk.compressed_size
    }

    pub fn bundle_id(&self) -> BundleId {
        self.src.bundle_id
    }

    pub fn compressed_offset(&self) -> u64 {
        self.src.compressed_offset
    }
}

/// 32-round keyed diffusion over a SHA-256 digest. `state` holds the SHA-256
/// of the message in its first half, zeros in the second; the first 8 bytes
/// are replaced with the mixed output.
fn rito_hkdf(state: &mut [u8; 64]) {
    let mut ipad = *state;
    for b in ipad.iter_mut() {
        *b ^= 0x36;
    }
    let mut opad = *state;
    for b in opad.iter_mut() {
        *b ^= 0x5C;
    }
    let inner = Sha256::new_with_prefix(ipad).chain_update([0u8, 0, 0, 1]).finalize();
    let mut tmp: [u8; 32] = Sha256::new_with_prefix(opad).chain_update(inner).finalize().into();
    state[..8].copy_from_slice(&tmp[..8]);
    for _ in 0..31 {
        let inner: [u8; 32] = Sha256::new_with_prefix(ipad).chain_update(tmp).finalize().into();
        tmp = Sha256::new_with_prefix(opad).chain_update(inner).finalize().into();
        for i in 0..8 {
            state[i] ^= tmp[i];
        }
    }
}

/// Hash `data` with `hash_type` and truncate to a chunk id.
pub fn hash(data: &[u8], hash_type: HashType) -> ChunkId {
    let mut out = [0u8; 64];
    match hash_type {
        HashType::None => return ChunkId::NONE,
        HashType::Sha512 => {
            out.copy_from_slice(&Sha512::digest(data));
        }
        HashType::Sha256 => {
            out[..32].copy_from_slice(&Sha256::digest(data));
        }
        HashType::RitoHkdf => {
            out[..32].copy_from_slice(&Sha256::digest(data));
            rito_hkdf(&mut out);
        }
    }
    ChunkId::from_raw(u64::from_le_bytes(out[..8].try_into().unwrap()))
}

/// Find which hash type produced `id` for `data`, trying SHA-256 first, then
/// RITO_HKDF (reusing the SHA-256 digest), then SHA-512.
pub fn detect_hash_type(data: &[u8], id: ChunkId) -> HashType {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&Sha256::digest(data));
    if u64::from_le_bytes(out[..8].try_into().unwrap()) == id.raw() {
        return HashType::Sha256;
    }

    rito_hkdf(&mut out);
    if u64::from_le_bytes(out[..8].try_into().unwrap()) == id.raw() {
        return HashType::RitoHkdf;
    }

    let out: [u8; 64] = Sha512::digest(data).into();
    if u64::from_le_bytes(out[..8].try_into().unwrap()) == id.raw() {
        return HashType::Sha512;
    }

    HashType::None
}
