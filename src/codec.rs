// src/codec.rs
//! Stateless block codecs for asset payloads.
//!
//! Three methods ship today:
//! * **Identity** – straight copy, used for already-tight data.
//! * **Lz4** – a dictionary coder with a 12-bit hash of the latest 4-byte
//!   prefix, 16-bit match offsets, and byte-wise match copies so an offset
//!   of 1 decodes as a run.
//! * **Rle** – the fallback for the stronger method slot: `0xFF len value`
//!   escapes for runs of three or more (and for any literal 0xFF byte).
//!
//! Every function here is a pure `&[u8] -> bytes` transform; coders hold no
//! state and are safe to call from any worker thread.

use crate::error::{Result, StreamError};

// ============================================================================
// Method ids (persisted in asset headers; keep the values stable)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    Rle = 2,
    /// Accepted on disk; decoded through the Rle path until a real
    /// entropy coder lands.
    Zstd = 3,
}

impl Compression {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Rle),
            3 => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Rle => "rle",
            Compression::Zstd => "zstd",
        }
    }
}

/// Compress `src` with the given method. Identity returns a plain copy.
pub fn compress(method: Compression, src: &[u8]) -> Vec<u8> {
    match method {
        Compression::None => src.to_vec(),
        Compression::Lz4 => lz4_compress(src),
        Compression::Rle | Compression::Zstd => rle_compress(src),
    }
}

/// Decompress `src` into `dst`, returning the number of bytes produced.
/// The caller sizes `dst` to the expected output; overrun is an error.
pub fn decompress_into(method: Compression, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    match method {
        Compression::None => {
            if src.len() > dst.len() {
                return Err(StreamError::Compression(format!(
                    "identity payload of {} bytes exceeds {}-byte destination",
                    src.len(),
                    dst.len()
                )));
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
        Compression::Lz4 => lz4_decompress_into(src, dst),
        Compression::Rle | Compression::Zstd => rle_decompress_into(src, dst),
    }
}

// ============================================================================
// LZ4-like dictionary coder
// ============================================================================

const HASH_BITS: u32 = 12;
const HASH_SIZE: usize = 1 << HASH_BITS;
const MAX_LITERAL_RUN: usize = 127;
const MIN_MATCH: usize = 4;
const MAX_MATCH: usize = MIN_MATCH + 0x7F;
const MAX_OFFSET: usize = 65535;
const EMPTY_SLOT: u32 = u32::MAX;

#[inline]
fn hash4(seq: u32) -> usize {
    (seq.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

#[inline]
fn read_u32_le(src: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]])
}

fn flush_literals(out: &mut Vec<u8>, literals: &[u8]) {
    for chunk in literals.chunks(MAX_LITERAL_RUN) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

pub fn lz4_compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / MAX_LITERAL_RUN + 1);
    let mut table = vec![EMPTY_SLOT; HASH_SIZE];

    let mut pos = 0usize;
    let mut literal_start = 0usize;

    while pos + MIN_MATCH <= src.len() {
        let seq = read_u32_le(src, pos);
        let slot = hash4(seq);
        let candidate = table[slot];
        table[slot] = pos as u32;

        if candidate != EMPTY_SLOT {
            let candidate = candidate as usize;
            let offset = pos - candidate;
            if offset >= 1 && offset <= MAX_OFFSET && read_u32_le(src, candidate) == seq {
                let mut len = MIN_MATCH;
                while pos + len < src.len() && len < MAX_MATCH && src[candidate + len] == src[pos + len]
                {
                    len += 1;
                }

                flush_literals(&mut out, &src[literal_start..pos]);
                out.push(0x80 | (len - MIN_MATCH) as u8);
                out.push((offset & 0xFF) as u8);
                out.push((offset >> 8) as u8);

                pos += len;
                literal_start = pos;
                continue;
            }
        }

        pos += 1;
    }

    flush_literals(&mut out, &src[literal_start..]);
    out
}

pub fn lz4_decompress_into(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let mut ip = 0usize;
    let mut op = 0usize;

    while ip < src.len() {
        let token = src[ip];
        ip += 1;

        if token & 0x80 != 0 {
            // Match token: [0x80 | len-4] [offset_lo] [offset_hi]
            let len = (token & 0x7F) as usize + MIN_MATCH;
            if ip + 2 > src.len() {
                return Err(StreamError::Compression(
                    "truncated match token".to_string(),
                ));
            }
            let offset = src[ip] as usize | ((src[ip + 1] as usize) << 8);
            ip += 2;

            if offset == 0 || offset > op {
                return Err(StreamError::Compression(format!(
                    "match offset {offset} reaches before output start (at {op})"
                )));
            }
            if op + len > dst.len() {
                return Err(StreamError::Compression(format!(
                    "output overflow: {} needed, {} available",
                    op + len,
                    dst.len()
                )));
            }
            // Byte-wise copy; an offset of 1 replicates the previous byte
            // into a run, which the overlap makes intentional.
            for k in 0..len {
                dst[op + k] = dst[op + k - offset];
            }
            op += len;
        } else {
            // Literal run: [len <= 127] [bytes...]
            let len = token as usize;
            if ip + len > src.len() {
                return Err(StreamError::Compression(
                    "truncated literal run".to_string(),
                ));
            }
            if op + len > dst.len() {
                return Err(StreamError::Compression(format!(
                    "output overflow: {} needed, {} available",
                    op + len,
                    dst.len()
                )));
            }
            dst[op..op + len].copy_from_slice(&src[ip..ip + len]);
            ip += len;
            op += len;
        }
    }

    Ok(op)
}

// ============================================================================
// RLE fallback
// ============================================================================

const RLE_ESCAPE: u8 = 0xFF;
const RLE_MIN_RUN: usize = 3;
const RLE_MAX_RUN: usize = 255;

pub fn rle_compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / RLE_MAX_RUN + 1);
    let mut pos = 0usize;

    while pos < src.len() {
        let value = src[pos];
        let mut run = 1usize;
        while pos + run < src.len() && src[pos + run] == value && run < RLE_MAX_RUN {
            run += 1;
        }

        if run >= RLE_MIN_RUN || value == RLE_ESCAPE {
            out.push(RLE_ESCAPE);
            out.push(run as u8);
            out.push(value);
        } else {
            for _ in 0..run {
                out.push(value);
            }
        }
        pos += run;
    }

    out
}

pub fn rle_decompress_into(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let mut ip = 0usize;
    let mut op = 0usize;

    while ip < src.len() {
        let byte = src[ip];
        ip += 1;

        if byte == RLE_ESCAPE {
            if ip + 2 > src.len() {
                return Err(StreamError::Compression(
                    "truncated rle escape".to_string(),
                ));
            }
            let run = src[ip] as usize;
            let value = src[ip + 1];
            ip += 2;
            if run == 0 {
                return Err(StreamError::Compression("zero-length rle run".to_string()));
            }
            if op + run > dst.len() {
                return Err(StreamError::Compression(format!(
                    "output overflow: {} needed, {} available",
                    op + run,
                    dst.len()
                )));
            }
            dst[op..op + run].fill(value);
            op += run;
        } else {
            if op >= dst.len() {
                return Err(StreamError::Compression(
                    "output overflow on literal".to_string(),
                ));
            }
            dst[op] = byte;
            op += 1;
        }
    }

    Ok(op)
}

// ============================================================================
// Tests
// ============================================================================
