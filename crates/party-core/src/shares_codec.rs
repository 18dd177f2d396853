//! Deterministic binary framing handed to, and read back from, the external
//! inference binary. Byte-for-byte fixed: the binary validates the header
//! literally.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::CodecError;
use crate::model::RingSharePair;

/// `1e 00 00 00 00 00 00 00` || `"malicious replicated Z2^64"` || `@ 00 00 00`.
pub const SHARES_HEADER: [u8; 38] = [
    0x1e, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6d, 0x61, 0x6c, 0x69, 0x63, 0x69, 0x6f, 0x75,
    0x73, 0x20, 0x72, 0x65, 0x70, 0x6c, 0x69, 0x63, 0x61, 0x74, 0x65, 0x64, 0x20, 0x5a, 0x32, 0x5e,
    0x36, 0x34, 0x40, 0x00, 0x00, 0x00,
];

fn to_signed_word(v: u64) -> i64 {
    if v >= 1u64 << 63 {
        (v as i128 - (1i128 << 64)) as i64
    } else {
        v as i64
    }
}

/// Writes the header (unless `append`) followed by the body words: each
/// replicated pair as two signed little-endian i64s, in order.
pub fn write_shares(
    path: &Path,
    shares: &[RingSharePair],
    append: bool,
) -> Result<(), CodecError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;

    if !append {
        file.write_all(&SHARES_HEADER)?;
    }

    for &(x_i, x_i1) in shares {
        file.write_all(&to_signed_word(x_i).to_le_bytes())?;
        file.write_all(&to_signed_word(x_i1).to_le_bytes())?;
    }
    Ok(())
}

/// Seeks to `file_size - 16*N`, reads `16*N` bytes, and unpacks `N` pairs
/// returned as `[x_{i+1}, x_i]` — the inference binary emits in reversed
/// order, so every read swaps to restore write-order semantics.
pub fn read_shares(path: &Path, n: usize) -> Result<Vec<RingSharePair>, CodecError> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let file_size = file.metadata()?.len();
    let needed = 16u64 * n as u64;
    if needed > file_size {
        return Err(CodecError::Truncated(n));
    }

    file.seek(SeekFrom::Start(file_size - needed))?;
    let mut buf = vec![0u8; needed as usize];
    file.read_exact(&mut buf)?;

    let mut out = Vec::with_capacity(n);
    for chunk in buf.chunks_exact(16) {
        let x_i1 = i64::from_le_bytes(chunk[0..8].try_into().unwrap()) as u64;
        let x_i = i64::from_le_bytes(chunk[8..16].try_into().unwrap()) as u64;
        out.push((x_i, x_i1));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_emits_literal_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.data");
        write_shares(&path, &[(1, 2)], false).unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[..38], &SHARES_HEADER[..]);
    }

    #[test]
    fn append_mode_omits_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.data");
        write_shares(&path, &[(1, 2)], false).unwrap();
        write_shares(&path, &[(3, 4)], true).unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 38 + 16 + 16);
    }

    #[test]
    fn round_trip_swaps_pair_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.data");
        write_shares(&path, &[(10, 20), (30, 40)], false).unwrap();
        let read_back = read_shares(&path, 2).unwrap();
        assert_eq!(read_back, vec![(20, 10), (40, 30)]);
    }

    #[test]
    fn negative_values_fold_through_signed_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.data");
        let huge = u64::MAX - 5;
        write_shares(&path, &[(huge, 1)], false).unwrap();
        let read_back = read_shares(&path, 1).unwrap();
        assert_eq!(read_back, vec![(1, huge)]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.data");
        write_shares(&path, &[(1, 2)], false).unwrap();
        let result = read_shares(&path, 5);
        assert!(matches!(result, Err(CodecError::Truncated(5))));
    }
}
