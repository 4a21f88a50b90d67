//! LZ4 decompression for compressed message payloads.
//!
//! Peers compress bulk payloads three different ways: a raw LZ4 block, the
//! LZ4 frame format, or a segmented "bv4" container whose chunks chain the
//! previously decompressed output as a dictionary. Decoding tries each in
//! order and never fails the connection; a payload that defeats all of them
//! is handled upstream by the embedded-plist scan.

use std::io::Read;

/// LZ4 frame format magic (little-endian on the wire).
pub(crate) const LZ4_FRAME_MAGIC: u32 = 0x184D_2204;

const BV4_COMPRESSED: u32 = 0x6276_3431; // "bv41"
const BV4_LITERAL: u32 = 0x6276_342D; // "bv4-"
const BV4_END: u32 = 0x6276_3424; // "bv4$"

/// Chunks may reference at most this much of the previous output.
const BV4_DICT_WINDOW: usize = 64 * 1024;

/// Decompress a raw LZ4 block into at most `max_out` bytes.
pub(crate) fn decompress_block(src: &[u8], max_out: usize) -> Option<Vec<u8>> {
    if src.is_empty() || max_out == 0 {
        return None;
    }
    let mut out = vec![0u8; max_out];
    match lz4_flex::block::decompress_into(src, &mut out) {
        Ok(written) => {
            out.truncate(written);
            Some(out)
        }
        Err(_) => None,
    }
}

fn decompress_block_with_dict(src: &[u8], max_out: usize, dict: &[u8]) -> Option<Vec<u8>> {
    if src.is_empty() || max_out == 0 {
        return None;
    }
    let mut out = vec![0u8; max_out];
    match lz4_flex::block::decompress_into_with_dict(src, &mut out, dict) {
        Ok(written) => {
            out.truncate(written);
            Some(out)
        }
        Err(_) => None,
    }
}

/// Decompress an LZ4 frame (magic `0x184D2204`), capped at `max_out` bytes.
pub(crate) fn decompress_frame(src: &[u8], max_out: usize) -> Option<Vec<u8>> {
    if src.len() < 7 || src[..4] != LZ4_FRAME_MAGIC.to_le_bytes() {
        return None;
    }
    let mut out = Vec::new();
    let mut decoder = lz4_flex::frame::FrameDecoder::new(src).take(max_out as u64 + 1);
    match decoder.read_to_end(&mut out) {
        Ok(n) if n <= max_out => Some(out),
        _ => None,
    }
}

struct Bv4Chunk<'a> {
    compressed: bool,
    uncompressed_len: usize,
    data: &'a [u8],
}

/// Decompress a "bv4" segmented container.
///
/// The first chunk is implicit (`u32 uncompressed | u32 compressed | bytes`);
/// subsequent chunks carry a big-endian tag. Compressed chunks may use up to
/// 64 KiB of already-produced output as a dictionary. If any chunk fails,
/// all compressed bytes are aggregated and decompressed in one pass.
pub(crate) fn decompress_bv4(src: &[u8]) -> Option<Vec<u8>> {
    let chunks = parse_bv4(src)?;

    let total: usize = chunks.iter().map(|c| c.uncompressed_len).sum();
    let mut out: Vec<u8> = Vec::with_capacity(total);

    let mut chunked_ok = true;
    for chunk in &chunks {
        if !chunk.compressed {
            out.extend_from_slice(chunk.data);
            continue;
        }
        let dict_start = out.len().saturating_sub(BV4_DICT_WINDOW);
        let decoded = decompress_block_with_dict(chunk.data, chunk.uncompressed_len, &out[dict_start..])
            .or_else(|| decompress_frame(chunk.data, chunk.uncompressed_len));
        match decoded {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => {
                chunked_ok = false;
                break;
            }
        }
    }
    if chunked_ok && !out.is_empty() {
        return Some(out);
    }

    // Aggregate fallback: treat all compressed chunks as one block.
    let mut aggregate = Vec::new();
    let mut aggregate_len = 0usize;
    for chunk in chunks.iter().filter(|c| c.compressed) {
        aggregate.extend_from_slice(chunk.data);
        aggregate_len += chunk.uncompressed_len;
    }
    if aggregate.is_empty() {
        return None;
    }
    let decoded = decompress_block(&aggregate, aggregate_len)
        .or_else(|| decompress_frame(&aggregate, aggregate_len))?;

    // Re-interleave literal chunks at their original positions.
    let mut out = Vec::with_capacity(total);
    let mut pos = 0usize;
    for chunk in &chunks {
        if chunk.compressed {
            let take = chunk.uncompressed_len.min(decoded.len().saturating_sub(pos));
            if take == 0 {
                break;
            }
            out.extend_from_slice(&decoded[pos..pos + take]);
            pos += take;
        } else {
            out.extend_from_slice(chunk.data);
        }
    }

    if out.is_empty() { None } else { Some(out) }
}

fn parse_bv4(src: &[u8]) -> Option<Vec<Bv4Chunk<'_>>> {
    if src.len() < 8 {
        return None;
    }

    let mut chunks = Vec::new();
    let mut pos = 0usize;

    // Implicit first chunk.
    let u0 = read_le32(src, pos)? as usize;
    let c0 = read_le32(src, pos + 4)? as usize;
    pos += 8;
    if c0 == 0 || pos + c0 > src.len() {
        return None;
    }
    chunks.push(Bv4Chunk {
        compressed: true,
        uncompressed_len: u0,
        data: &src[pos..pos + c0],
    });
    pos += c0;

    while pos + 4 <= src.len() {
        let tag = read_be32(src, pos)?;
        match tag {
            BV4_END => break,
            BV4_COMPRESSED => {
                if pos + 12 > src.len() {
                    return None;
                }
                let u = read_le32(src, pos + 4)? as usize;
                let c = read_le32(src, pos + 8)? as usize;
                pos += 12;
                if c == 0 || pos + c > src.len() {
                    return None;
                }
                chunks.push(Bv4Chunk {
                    compressed: true,
                    uncompressed_len: u,
                    data: &src[pos..pos + c],
                });
                pos += c;
            }
            BV4_LITERAL => {
                if pos + 8 > src.len() {
                    return None;
                }
                let len = read_le32(src, pos + 4)? as usize;
                pos += 8;
                if len == 0 || pos + len > src.len() {
                    return None;
                }
                chunks.push(Bv4Chunk {
                    compressed: false,
                    uncompressed_len: len,
                    data: &src[pos..pos + len],
                });
                pos += len;
            }
            _ => break,
        }
    }

    if chunks.is_empty() { None } else { Some(chunks) }
}

fn read_le32(buf: &[u8], pos: usize) -> Option<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_be32(buf: &[u8], pos: usize) -> Option<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
