//! Payload compression.
//!
//! | Name   | Flag   | Role                          | Backend            |
//! |--------|--------|-------------------------------|--------------------|
//! | `none` | `0x00` | small or incompressible data  | -                  |
//! | `lz4`  | `0x10` | fast, the default choice      | `lz4` block API    |
//! | `zstd` | `0x40` | general purpose / high ratio  | `zstd` bulk API    |
//!
//! The level byte produced by a compressor is `min(15, level) | flag` and
//! travels in the packet header (or inside a [`CompressedPayload`]), so the
//! receiver can pick the decompressor without any other context.

use serde::{Deserialize, Serialize};

use crate::error::PixwireError;
use crate::flags::{ALGO_MASK, LEVEL_MASK, LZ4_FLAG, RESERVED_FLAG, ZSTD_FLAG};

/// Hard ceiling on payload sizes, compressed or not.
pub const MAX_SIZE: usize = 256 * 1024 * 1024;
/// Payloads this small are never worth compressing.
pub const MIN_COMPRESS_SIZE: usize = 378;
/// Compressed output must beat the input by at least this many bytes.
pub const DEFAULT_MIN_SAVING: usize = 128;
/// Payloads above this size are sent as separate raw chunks.
pub const INLINE_SIZE: usize = 32 * 1024;

/// Preference order used when several algorithms are enabled.
pub const PERFORMANCE_ORDER: [Algorithm; 2] = [Algorithm::Lz4, Algorithm::Zstd];

// ── Algorithm ────────────────────────────────────────────────────

/// A compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    None,
    Lz4,
    Zstd,
}

impl Algorithm {
    /// Registry name.
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Lz4 => "lz4",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Flag bits in the level byte.
    pub fn flag(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Lz4 => LZ4_FLAG,
            Algorithm::Zstd => ZSTD_FLAG,
        }
    }

    /// Look up an algorithm by registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Algorithm::None),
            "lz4" => Some(Algorithm::Lz4),
            "zstd" => Some(Algorithm::Zstd),
            _ => None,
        }
    }

    /// Decode the algorithm selected by a level byte.
    pub fn from_level(level: u8) -> Result<Self, PixwireError> {
        match level & ALGO_MASK {
            0 if level & LEVEL_MASK == 0 => Ok(Algorithm::None),
            0 => Err(PixwireError::UnsupportedCompressor("zlib".into())),
            LZ4_FLAG => Ok(Algorithm::Lz4),
            ZSTD_FLAG => Ok(Algorithm::Zstd),
            RESERVED_FLAG => Err(PixwireError::UnsupportedCompressor("lzo".into())),
            _ => Err(PixwireError::UnsupportedCompressor(format!(
                "invalid level byte {level:#04x}"
            ))),
        }
    }

    /// Registry entry for this algorithm.
    pub fn compressor(self) -> &'static Compressor {
        match self {
            Algorithm::None => &COMPRESSORS[0],
            Algorithm::Lz4 => &COMPRESSORS[1],
            Algorithm::Zstd => &COMPRESSORS[2],
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Registry ─────────────────────────────────────────────────────

/// One entry of the compressor registry.
pub struct Compressor {
    /// Algorithm served by this entry.
    pub algorithm: Algorithm,
    compress_fn: fn(&[u8], u8) -> Result<Vec<u8>, PixwireError>,
    decompress_fn: fn(&[u8]) -> Result<Vec<u8>, PixwireError>,
    version_fn: fn() -> Option<String>,
}

impl Compressor {
    /// Compress `data`, returning the level byte (with flag) and the bytes.
    pub fn compress(&self, data: &[u8], level: u8) -> Result<(u8, Vec<u8>), PixwireError> {
        let level = level.min(LEVEL_MASK);
        let out = (self.compress_fn)(data, level)?;
        let level_byte = match self.algorithm {
            Algorithm::None => 0,
            algo => level.max(1) | algo.flag(),
        };
        Ok((level_byte, out))
    }

    /// Decompress bytes produced by [`compress`](Self::compress).
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, PixwireError> {
        (self.decompress_fn)(data)
    }

    /// Version of the backing library, when known.
    pub fn version(&self) -> Option<String> {
        (self.version_fn)()
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("algorithm", &self.algorithm)
            .field("version", &self.version())
            .finish()
    }
}

static COMPRESSORS: [Compressor; 3] = [
    Compressor {
        algorithm: Algorithm::None,
        compress_fn: copy_compress,
        decompress_fn: copy_decompress,
        version_fn: no_version,
    },
    Compressor {
        algorithm: Algorithm::Lz4,
        compress_fn: lz4_compress,
        decompress_fn: lz4_decompress,
        version_fn: lz4_version,
    },
    Compressor {
        algorithm: Algorithm::Zstd,
        compress_fn: zstd_compress,
        decompress_fn: zstd_decompress,
        version_fn: zstd_version,
    },
];

/// Look up a compressor by registry name.
pub fn get_compressor(name: &str) -> Option<&'static Compressor> {
    Algorithm::from_name(name).map(Algorithm::compressor)
}

/// Parse configured compressor names, skipping unknown ones.
pub fn parse_enabled(names: &[String]) -> Vec<Algorithm> {
    let mut out = Vec::new();
    for name in names {
        match Algorithm::from_name(name) {
            Some(Algorithm::None) => {}
            Some(algo) if !out.contains(&algo) => out.push(algo),
            Some(_) => {}
            None => tracing::warn!(compressor = %name, "ignoring unknown compressor"),
        }
    }
    out
}

// ── Backends ─────────────────────────────────────────────────────

fn copy_compress(data: &[u8], _level: u8) -> Result<Vec<u8>, PixwireError> {
    Ok(data.to_vec())
}

fn copy_decompress(data: &[u8]) -> Result<Vec<u8>, PixwireError> {
    Ok(data.to_vec())
}

fn no_version() -> Option<String> {
    None
}

fn lz4_version() -> Option<String> {
    Some(lz4::version().to_string())
}

fn zstd_version() -> Option<String> {
    Some(zstd::zstd_safe::version_string().to_string())
}

fn lz4_compress(data: &[u8], level: u8) -> Result<Vec<u8>, PixwireError> {
    use lz4::block::CompressionMode;
    let mode = if level >= 7 {
        Some(CompressionMode::HIGHCOMPRESSION(level as i32))
    } else if level <= 3 {
        Some(CompressionMode::FAST(8 - level as i32 * 2))
    } else {
        None
    };
    lz4::block::compress(data, mode, true).map_err(|e| PixwireError::Compression(format!("lz4: {e}")))
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>, PixwireError> {
    if data.len() < 4 {
        return Err(PixwireError::Compression("lz4: missing size prefix".into()));
    }
    let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size > MAX_SIZE {
        return Err(PixwireError::PayloadTooLarge {
            size,
            max: MAX_SIZE,
        });
    }
    lz4::block::decompress(data, None).map_err(|e| PixwireError::Compression(format!("lz4: {e}")))
}

fn zstd_compress(data: &[u8], level: u8) -> Result<Vec<u8>, PixwireError> {
    zstd::bulk::compress(data, level.max(1) as i32)
        .map_err(|e| PixwireError::Compression(format!("zstd: {e}")))
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, PixwireError> {
    zstd::bulk::decompress(data, MAX_SIZE).map_err(|e| PixwireError::Compression(format!("zstd: {e}")))
}

// ── CompressedPayload ────────────────────────────────────────────

/// A payload as it goes on the wire, compressed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedPayload {
    /// What the payload holds ("pixels", "rgb32", "h264", ...).
    pub datatype: String,
    /// The (possibly compressed) bytes.
    pub data: Vec<u8>,
    /// Level byte, including the algorithm flag; 0 when uncompressed.
    pub level: u8,
    /// Algorithm used.
    pub algorithm: Algorithm,
    /// Whether the framing layer may embed the bytes in the main packet.
    pub can_inline: bool,
}

impl CompressedPayload {
    /// Wrap bytes without compressing them.
    pub fn uncompressed(datatype: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            datatype: datatype.into(),
            data,
            level: 0,
            algorithm: Algorithm::None,
            can_inline: true,
        }
    }

    /// Wrap already-encoded codec output (video bitstreams, jpeg, ...).
    pub fn encoded(datatype: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            can_inline: false,
            ..Self::uncompressed(datatype, data)
        }
    }

    /// Whether the payload needs decompressing.
    pub fn is_compressed(&self) -> bool {
        self.algorithm != Algorithm::None
    }

    /// Wire size of the payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Recover the original bytes.
    pub fn decompress(&self, enabled: &[Algorithm]) -> Result<Vec<u8>, PixwireError> {
        decompress(&self.data, self.level, enabled)
    }
}

// ── Public API ───────────────────────────────────────────────────

/// Compress `data` with `algorithm`, returning `(level_byte, bytes)`.
pub fn compress(algorithm: Algorithm, data: &[u8], level: u8) -> Result<(u8, Vec<u8>), PixwireError> {
    check_size(data.len())?;
    algorithm.compressor().compress(data, level)
}

/// Wrap `data` for transmission, compressing it when that pays off.
///
/// Uses the first enabled algorithm in [`PERFORMANCE_ORDER`] and
/// [`MIN_COMPRESS_SIZE`] as the lower bound.
pub fn compressed_wrapper(
    datatype: &str,
    data: &[u8],
    level: u8,
    enabled: &[Algorithm],
    min_saving: usize,
) -> Result<CompressedPayload, PixwireError> {
    compressed_wrapper_with(datatype, data, level, enabled, min_saving, MIN_COMPRESS_SIZE)
}

/// Same as [`compressed_wrapper`] with an explicit minimum size.
pub fn compressed_wrapper_with(
    datatype: &str,
    data: &[u8],
    level: u8,
    enabled: &[Algorithm],
    min_saving: usize,
    min_compress_size: usize,
) -> Result<CompressedPayload, PixwireError> {
    check_size(data.len())?;
    if data.len() <= min_compress_size || level == 0 {
        return Ok(CompressedPayload::uncompressed(datatype, data.to_vec()));
    }
    let Some(algorithm) = PERFORMANCE_ORDER.iter().copied().find(|a| enabled.contains(a)) else {
        return Ok(CompressedPayload::uncompressed(datatype, data.to_vec()));
    };
    let (level_byte, cdata) = algorithm.compressor().compress(data, level)?;
    if cdata.len() + min_saving > data.len() {
        tracing::trace!(
            datatype,
            size = data.len(),
            compressed = cdata.len(),
            "compression does not save enough, sending as-is"
        );
        return Ok(CompressedPayload::uncompressed(datatype, data.to_vec()));
    }
    Ok(CompressedPayload {
        datatype: datatype.to_string(),
        data: cdata,
        level: level_byte,
        algorithm,
        can_inline: false,
    })
}

/// Decompress `data` according to the algorithm bits in `level`.
pub fn decompress(data: &[u8], level: u8, enabled: &[Algorithm]) -> Result<Vec<u8>, PixwireError> {
    let algorithm = Algorithm::from_level(level)?;
    if algorithm != Algorithm::None && !enabled.contains(&algorithm) {
        return Err(PixwireError::UnsupportedCompressor(format!(
            "{algorithm} is not enabled"
        )));
    }
    algorithm.compressor().decompress(data)
}

/// Decompress `data` compressed with the named algorithm.
pub fn decompress_by_name(data: &[u8], name: &str, enabled: &[Algorithm]) -> Result<Vec<u8>, PixwireError> {
    let algorithm = Algorithm::from_name(name)
        .ok_or_else(|| PixwireError::UnsupportedCompressor(name.to_string()))?;
    let level = match algorithm {
        Algorithm::None => 0,
        algo => algo.flag() | 1,
    };
    decompress(data, level, enabled)
}

fn check_size(size: usize) -> Result<(), PixwireError> {
    if size > MAX_SIZE {
        return Err(PixwireError::PayloadTooLarge {
            size,
            max: MAX_SIZE,
        });
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
