//! Split-window CRC32C for V5 metadata blocks.
//!
//! Every V5 metadata block stores a CRC32C (Castagnoli) at a per-type
//! offset. The checksum covers the whole block with the 4-byte CRC field
//! treated as zero, and the finalized value is stored big-endian.

use uxfs_types::{read_be_u32, write_be_u32};

/// Compute the finalized CRC32C of `buf` with the 4 bytes at `cksum_offset`
/// replaced by zeroes.
#[must_use]
pub fn split_cksum(buf: &[u8], cksum_offset: usize) -> u32 {
    debug_assert!(cksum_offset + 4 <= buf.len());
    let crc = crc32c::crc32c(&buf[..cksum_offset]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    crc32c::crc32c_append(crc, &buf[cksum_offset + 4..])
}

/// Verify the stored checksum of a metadata block.
#[must_use]
pub fn verify_cksum(buf: &[u8], cksum_offset: usize) -> bool {
    if cksum_offset + 4 > buf.len() {
        return false;
    }
    let stored = match read_be_u32(buf, cksum_offset) {
        Ok(v) => v,
        Err(_) => return false,
    };
    split_cksum(buf, cksum_offset) == stored
}

/// Recompute and store the checksum of a metadata block.
pub fn update_cksum(buf: &mut [u8], cksum_offset: usize) {
    let crc = split_cksum(buf, cksum_offset);
    write_be_u32(buf, cksum_offset, crc);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_verify() {
        let mut buf = vec![0xA5_u8; 512];
        update_cksum(&mut buf, 224);
        assert!(verify_cksum(&buf, 224));
    }

    #[test]
    fn corruption_detected() {
        let mut buf = vec![0x5A_u8; 512];
        update_cksum(&mut buf, 4);
        buf[300] ^= 1;
        assert!(!verify_cksum(&buf, 4));
    }

    #[test]
    fn crc_field_is_masked() {
        // Two buffers differing only in the checksum window compute the
        // same CRC.
        let mut a = vec![7_u8; 128];
        let mut b = a.clone();
        a[64..68].copy_from_slice(&[1, 2, 3, 4]);
        b[64..68].copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(split_cksum(&a, 64), split_cksum(&b, 64));
    }

    #[test]
    fn verify_rejects_short_buffer() {
        let buf = [0_u8; 4];
        assert!(!verify_cksum(&buf, 2));
    }

    #[test]
    fn window_at_start_and_end() {
        let mut buf = vec![3_u8; 64];
        update_cksum(&mut buf, 0);
        assert!(verify_cksum(&buf, 0));
        let mut buf = vec![3_u8; 64];
        update_cksum(&mut buf, 60);
        assert!(verify_cksum(&buf, 60));
    }
}
