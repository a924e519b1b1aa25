//! Frame compression using DEFLATE via `miniz_oxide`.
//!
//! A compressed frame keeps its 14-byte header (with compression status 2 and
//! the compressed total size) followed by the 4-byte uncompressed total size
//! and the DEFLATE stream of the original body.

use crate::error::{Error, Result};
use crate::protocol::header::{
    patch_size, CompressionStatus, COMPRESSION_OFFSET, HEADER_SIZE,
};
use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec_with_limit;
use tracing::{debug, trace, warn};

/// Frames smaller than this are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 100;

const UNCOMPRESSED_SIZE_LEN: usize = 4;

/// Clamp a configured compression level into the supported 1..=9 range.
pub fn clamp_level(level: i32) -> u8 {
    level.clamp(1, 9) as u8
}

/// Compress a payload. Returns `None` when the result would not be smaller.
pub fn compress(payload: &[u8], level: i32) -> Option<Vec<u8>> {
    let compressed = compress_to_vec(payload, clamp_level(level));
    if compressed.len() >= payload.len() {
        trace!(
            original = payload.len(),
            compressed = compressed.len(),
            "Compression did not shrink payload"
        );
        return None;
    }
    Some(compressed)
}

/// Inflate a payload, refusing to produce more than `max_size` bytes.
pub fn decompress(payload: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let limit = if max_size == 0 { usize::MAX } else { max_size };
    decompress_to_vec_with_limit(payload, limit).map_err(|e| {
        warn!(error = ?e, "Failed to inflate compressed payload");
        Error::Compression {
            reason: format!("inflate failed: {:?}", e.status),
        }
    })
}

/// Compress a complete frame. Returns `None` if the frame is below the
/// threshold or does not shrink.
pub fn compress_frame(frame: &[u8], level: i32) -> Option<Vec<u8>> {
    if frame.len() < MIN_COMPRESS_SIZE {
        return None;
    }
    let body = compress(&frame[HEADER_SIZE..], level)?;
    let total = HEADER_SIZE + UNCOMPRESSED_SIZE_LEN + body.len();
    if total >= frame.len() {
        return None;
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&frame[..HEADER_SIZE]);
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out[COMPRESSION_OFFSET] = CompressionStatus::Compressed as u8;
    patch_size(&mut out, total);
    debug!(original = frame.len(), compressed = total, "Compressed frame");
    Some(out)
}

/// Restore a compressed frame to its uncompressed form.
pub fn decompress_frame(frame: &[u8], max_size: usize) -> Result<Vec<u8>> {
    if frame.len() < HEADER_SIZE + UNCOMPRESSED_SIZE_LEN {
        return Err(Error::IllegalMessageSize {
            size: frame.len() as i64,
        });
    }
    let mut size = [0u8; 4];
    size.copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + UNCOMPRESSED_SIZE_LEN]);
    let uncompressed_size = i32::from_be_bytes(size);
    if uncompressed_size < HEADER_SIZE as i32 {
        return Err(Error::IllegalMessageSize {
            size: i64::from(uncompressed_size),
        });
    }
    let uncompressed_size = uncompressed_size as usize;
    if max_size > 0 && uncompressed_size > max_size {
        return Err(Error::MessageTooLarge {
            size: uncompressed_size,
            max_size,
        });
    }

    let body = decompress(
        &frame[HEADER_SIZE + UNCOMPRESSED_SIZE_LEN..],
        uncompressed_size - HEADER_SIZE,
    )?;
    if body.len() != uncompressed_size - HEADER_SIZE {
        return Err(Error::Compression {
            reason: format!(
                "expected {} uncompressed bytes, got {}",
                uncompressed_size - HEADER_SIZE,
                body.len()
            ),
        });
    }

    let mut out = Vec::with_capacity(uncompressed_size);
    out.extend_from_slice(&frame[..HEADER_SIZE]);
    out.extend_from_slice(&body);
    patch_size(&mut out, uncompressed_size);
    Ok(out)
}

/// Finalize an outgoing frame: compress it if requested and worthwhile, then
/// fill in the compression status and size fields.
///
/// A frame for which compression was requested but that is below the
/// threshold advertises status 1 so the peer may compress its reply; a frame
/// whose compression attempt failed to shrink it goes out with status 0.
pub fn prepare_frame(mut frame: Vec<u8>, compress: bool, level: i32) -> Vec<u8> {
    if compress {
        if frame.len() >= MIN_COMPRESS_SIZE {
            if let Some(compressed) = compress_frame(&frame, level) {
                return compressed;
            }
            frame[COMPRESSION_OFFSET] = CompressionStatus::None as u8;
        } else {
            frame[COMPRESSION_OFFSET] = CompressionStatus::Supported as u8;
        }
    } else {
        frame[COMPRESSION_OFFSET] = CompressionStatus::None as u8;
    }
    let len = frame.len();
    patch_size(&mut frame, len);
    frame
}
