// Indexed frame container
//
// Layout (little-endian, 48-byte header):
//
//   0  u8   magic 0xED
//   1  u8   version 1
//   2  u8   channels
//   3  u8   bitcount
//   4  u32  width
//   8  u32  height
//  12  u32  black level
//  16  u8x4 bayer mosaic, first row then second row (zeros if not bayer)
//  20  f32  kR, kG, kB
//  32  u8x4 compression tag ("LZ4\0")
//  36       padding
//  40  u64  index start offset, zero until the file is finalized
//
// Followed by LZ4 block payloads back to back, then one u64 absolute offset
// per frame slot. A zero offset marks a slot with no recorded frame.

pub mod reader;
pub mod writer;

pub use reader::ContainerReader;
pub use writer::{build_index, frame_slot, missing_slots_between, ContainerWriter};

use serde::{Deserialize, Serialize};

pub const MAGIC: u8 = 0xED;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 48;
/// Length of the header fields that precede the compression tag
pub const RAW_FOOTER_LEN: usize = 32;
pub const INDEX_OFFSET_POS: u64 = 40;
pub const COMPRESSION_LZ4: [u8; 4] = *b"LZ4\0";

/// Error type for container operations
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Not a container file (magic 0x{0:02X})")]
    BadMagic(u8),

    #[error("Unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported compression {0:?}")]
    UnsupportedCompression(String),

    #[error("File truncated: {0}")]
    Truncated(String),

    #[error("Container was never finalized (no index)")]
    Unfinalized,

    #[error("Frame slot {0} out of range")]
    SlotOutOfRange(usize),

    #[error("Decompression failed: {0}")]
    Decompress(String),

    #[error("Slot {slot} payload of {len} bytes exceeds the {max} byte bound")]
    OversizedPayload { slot: usize, len: u64, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// Color filter mosaic of a single-channel sensor, named by its 2x2 tile read
/// row by row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl BayerPattern {
    pub const ALL: &'static [BayerPattern] = &[
        BayerPattern::Rggb,
        BayerPattern::Bggr,
        BayerPattern::Grbg,
        BayerPattern::Gbrg,
    ];

    pub fn code(&self) -> [u8; 4] {
        match self {
            BayerPattern::Rggb => *b"RGGB",
            BayerPattern::Bggr => *b"BGGR",
            BayerPattern::Grbg => *b"GRBG",
            BayerPattern::Gbrg => *b"GBRG",
        }
    }

    pub fn from_code(code: &[u8; 4]) -> Option<BayerPattern> {
        Self::ALL.iter().copied().find(|p| &p.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BayerPattern::Rggb => "RGGB",
            BayerPattern::Bggr => "BGGR",
            BayerPattern::Grbg => "GRBG",
            BayerPattern::Gbrg => "GBRG",
        }
    }

    /// Position (x, y) of the red sample inside the 2x2 tile
    pub fn red_offset(&self) -> (usize, usize) {
        match self {
            BayerPattern::Rggb => (0, 0),
            BayerPattern::Grbg => (1, 0),
            BayerPattern::Gbrg => (0, 1),
            BayerPattern::Bggr => (1, 1),
        }
    }
}

/// White balance multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorBalance {
    pub k_r: f32,
    pub k_g: f32,
    pub k_b: f32,
}

impl Default for ColorBalance {
    fn default() -> Self {
        Self { k_r: 1.0, k_g: 1.0, k_b: 1.0 }
    }
}

/// Fixed-size file header
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHeader {
    pub channels: u8,
    pub bitcount: u8,
    pub width: u32,
    pub height: u32,
    pub black_level: u32,
    pub bayer: Option<BayerPattern>,
    /// Only meaningful for bayer sources; stored as zeros otherwise
    pub balance: ColorBalance,
    pub compression: [u8; 4],
    pub index_offset: u64,
}

impl ContainerHeader {
    pub fn new(width: u32, height: u32, bitcount: u8, black_level: u32, bayer: Option<BayerPattern>, balance: ColorBalance) -> Self {
        Self {
            channels: 1,
            bitcount,
            width,
            height,
            black_level,
            bayer,
            balance,
            compression: COMPRESSION_LZ4,
            index_offset: 0,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        if self.bitcount > 8 { 2 } else { 1 }
    }

    /// Size of one decompressed frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels.max(1) as usize * self.bytes_per_pixel()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..RAW_FOOTER_LEN].copy_from_slice(&self.raw_footer());
        out[32..36].copy_from_slice(&self.compression);
        out[40..48].copy_from_slice(&self.index_offset.to_le_bytes());
        out
    }

    /// Header fields up to the white balance, appended to RAW stills
    pub fn raw_footer(&self) -> [u8; RAW_FOOTER_LEN] {
        let mut out = [0u8; RAW_FOOTER_LEN];
        out[0] = MAGIC;
        out[1] = VERSION;
        out[2] = self.channels;
        out[3] = self.bitcount;
        out[4..8].copy_from_slice(&self.width.to_le_bytes());
        out[8..12].copy_from_slice(&self.height.to_le_bytes());
        out[12..16].copy_from_slice(&self.black_level.to_le_bytes());
        if let Some(pattern) = self.bayer {
            out[16..20].copy_from_slice(&pattern.code());
            out[20..24].copy_from_slice(&self.balance.k_r.to_le_bytes());
            out[24..28].copy_from_slice(&self.balance.k_g.to_le_bytes());
            out[28..32].copy_from_slice(&self.balance.k_b.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ContainerError::Truncated(format!("header is {} bytes", bytes.len())));
        }
        if bytes[0] != MAGIC {
            return Err(ContainerError::BadMagic(bytes[0]));
        }
        if bytes[1] != VERSION {
            return Err(ContainerError::UnsupportedVersion(bytes[1]));
        }

        let u32_at = |pos: usize| u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        let f32_at = |pos: usize| f32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);

        let mut code = [0u8; 4];
        code.copy_from_slice(&bytes[16..20]);
        let mut compression = [0u8; 4];
        compression.copy_from_slice(&bytes[32..36]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&bytes[40..48]);

        Ok(Self {
            channels: bytes[2],
            bitcount: bytes[3],
            width: u32_at(4),
            height: u32_at(8),
            black_level: u32_at(12),
            bayer: BayerPattern::from_code(&code),
            balance: ColorBalance {
                k_r: f32_at(20),
                k_g: f32_at(24),
                k_b: f32_at(28),
            },
            compression,
            index_offset: u64::from_le_bytes(offset),
        })
    }
}

/// Compress one frame payload as a bare LZ4 block
pub fn compress_frame(pixels: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(pixels)
}

/// Upper bound on the compressed size of a `len`-byte frame
pub fn max_compressed_len(len: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_field_offsets() {
        let mut header = ContainerHeader::new(
            640,
            480,
            12,
            64,
            Some(BayerPattern::Bggr),
            ColorBalance { k_r: 1.5, k_g: 1.0, k_b: 2.25 },
        );
        header.index_offset = 0x0102_0304_0506_0708;
        let bytes = header.to_bytes();

        assert_eq!(bytes[0], 0xED);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 12);
        assert_eq!(&bytes[4..8], &640u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &480u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &64u32.to_le_bytes());
        assert_eq!(&bytes[16..20], b"BGGR");
        assert_eq!(&bytes[20..24], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[28..32], &2.25f32.to_le_bytes());
        assert_eq!(&bytes[32..36], b"LZ4\0");
        assert_eq!(&bytes[36..40], &[0, 0, 0, 0]);
        assert_eq!(&bytes[40..48], &0x0102_0304_0506_0708u64.to_le_bytes());

        assert_eq!(ContainerHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn mono_header_has_blank_mosaic_and_balance() {
        let header = ContainerHeader::new(8, 8, 8, 0, None, ColorBalance::default());
        let bytes = header.to_bytes();
        assert_eq!(&bytes[16..32], &[0u8; 16]);
        let parsed = ContainerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.bayer, None);
        assert_eq!(parsed.frame_len(), 64);
    }

    #[test]
    fn rejects_foreign_files() {
        let mut bytes = ContainerHeader::new(1, 1, 8, 0, None, ColorBalance::default()).to_bytes();
        bytes[0] = 0x89;
        assert!(matches!(ContainerHeader::from_bytes(&bytes), Err(ContainerError::BadMagic(0x89))));
        assert!(matches!(ContainerHeader::from_bytes(&bytes[..20]), Err(ContainerError::Truncated(_))));
    }

    #[test]
    fn bayer_codes_round_trip() {
        for pattern in BayerPattern::ALL {
            assert_eq!(BayerPattern::from_code(&pattern.code()), Some(*pattern));
        }
        assert_eq!(BayerPattern::from_code(b"    "), None);
    }
}
