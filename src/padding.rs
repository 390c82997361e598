//! Repair of legacy PKCS#7 padding left on decrypted files
//!
//! Older write paths decrypted PKCS#7-padded content without stripping the
//! padding, sometimes wrote it back with a wrong declared size, and then
//! re-encrypted it without padding. The result is otherwise-correct
//! plaintext followed by stray PKCS#7 bytes and possibly a run of zeros.
//!
//! [`try_fix_padding`] only truncates when every structural check passes, so
//! it is safe to run on arbitrary files and idempotent on repaired ones.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Cipher block size the padding was computed for
pub const BLOCK_SIZE: u64 = 16;

/// Chunk size used when scanning backward for the last non-zero byte
const SCAN_CHUNK_SIZE: u64 = 1024;

/// Remove trailing PKCS#7 padding (and zero slack after it) from a file.
///
/// Returns `Ok(true)` when the file was truncated and `Ok(false)` when no
/// valid padding pattern was found. Sanity-check failures never error.
pub fn try_fix_padding<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_length = file.metadata()?.len();

    if file_length < BLOCK_SIZE {
        return Ok(false);
    }

    let actual_size = match last_non_zero_offset(&mut file, file_length)? {
        Some(offset) => offset + 1,
        None => {
            debug!(path = %path.display(), "file is all zeros, leaving untouched");
            return Ok(false);
        }
    };

    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(actual_size - 1))?;
    file.read_exact(&mut byte)?;
    let padding = u64::from(byte[0]);

    debug!(path = %path.display(), padding, "assuming padding length");

    if actual_size < padding {
        debug!(actual_size, padding, "content shorter than padding");
        return Ok(false);
    }

    if actual_size % BLOCK_SIZE != 0 {
        debug!(actual_size, "content size is not a multiple of the block size");
        return Ok(false);
    }

    let mut padding_bytes = vec![0u8; padding as usize];
    file.seek(SeekFrom::Start(actual_size - padding))?;
    file.read_exact(&mut padding_bytes)?;

    if let Some(index) = padding_bytes.iter().position(|&b| u64::from(b) != padding) {
        debug!(index, found = padding_bytes[index], padding, "invalid padding byte");
        return Ok(false);
    }

    file.set_len(actual_size - padding)?;
    debug!(
        path = %path.display(),
        from = file_length,
        to = actual_size - padding,
        "removed legacy padding"
    );
    Ok(true)
}

/// Offset of the last non-zero byte, scanning backward in bounded chunks
fn last_non_zero_offset<F: Read + Seek>(file: &mut F, length: u64) -> io::Result<Option<u64>> {
    let mut position = length;
    let mut buffer = vec![0u8; SCAN_CHUNK_SIZE as usize];

    while position > 0 {
        let read_size = SCAN_CHUNK_SIZE.min(position);
        position -= read_size;

        let chunk = &mut buffer[..read_size as usize];
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(chunk)?;

        if let Some(index) = chunk.iter().rposition(|&b| b != 0) {
            return Ok(Some(position + index as u64));
        }
    }

    Ok(None)
}
