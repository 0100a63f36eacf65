//! Work encoding and double-SHA256 verification.
//!
//! The job server hands out getwork data as 128 bytes in which every 4-byte
//! word is byte-swapped relative to the serialized block header
//! ("middle-endian"). A [`WorkItem`] keeps the data exactly as received (it
//! is what gets submitted back) and converts the first 80 bytes into the
//! canonical header once, when the item is created. All nonce hashing then
//! works on the canonical copy.
//!
//! ## Nonce verification
//!
//! The FPGA does not return digests. Alongside every counter value it
//! reports a witness word: the top word of the final SHA-256 state before
//! the last chaining addition. Adding the SHA-256 initial value `H7`
//! (`0x5be0cd19`) reconstructs the digest's top word, which the host can
//! compare against its own hash. Because of pipeline latency the counter
//! may be a step or two away from the nonce the witness belongs to, so a
//! small window of offsets is tried.

use bitcoin::hashes::{sha256d, Hash};

/// Getwork data length (80 header bytes plus SHA-256 padding).
pub const WORK_DATA_LEN: usize = 128;

/// Serialized block header length.
pub const HEADER_LEN: usize = 80;

/// SHA-256 midstate length.
pub const MIDSTATE_LEN: usize = 32;

/// Payload sent to the device: header bytes 64..76 followed by the midstate.
pub const DEVICE_PAYLOAD_LEN: usize = 44;

/// SHA-256 initial hash value H7, added to the device's witness word.
pub const WITNESS_BIAS: u32 = 0x5be0_cd19;

/// Offsets around a reported counter tried by [`WorkItem::check_nonce`].
///
/// Order matters only for speed: the exact counter matches most of the time.
pub const NONCE_CHECK_OFFSETS: [i32; 5] = [0, 1, -1, 2, -2];

const NONCE_POS: usize = 76;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("{field} has {actual} bytes, expected {expected}")]
    InvalidLength {
        field: &'static str,
        actual: usize,
        expected: usize,
    },
}

/// Convert getwork data into canonical header byte order.
///
/// Reverses the bytes of each 4-byte word of the first 80 bytes.
pub fn swap_words(data: &[u8; WORK_DATA_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    for (dst, src) in header.chunks_exact_mut(4).zip(data.chunks_exact(4)) {
        dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
    }
    header
}

/// Double SHA-256 of a canonical header with `nonce` patched into its last
/// four bytes.
///
/// The device counts nonces in the byte order of the getwork words, which
/// lands big-endian in the canonical header.
pub fn hash(header: &[u8; HEADER_LEN], nonce: u32) -> [u8; 32] {
    let mut block = *header;
    block[NONCE_POS..].copy_from_slice(&nonce.to_be_bytes());
    sha256d::Hash::hash(&block).to_byte_array()
}

/// Most significant word of a digest (bytes 28..32 of the little-endian
/// 256-bit value).
pub fn top_word(digest: &[u8; 32]) -> u32 {
    u32::from_be_bytes([digest[28], digest[29], digest[30], digest[31]])
}

/// Device-level acceptance: the most significant four bytes are zero.
///
/// This is a fixed protocol threshold, not the job server's target; the
/// server does the final validation on submission.
pub fn is_golden(digest: &[u8; 32]) -> bool {
    top_word(digest) == 0
}

/// Decode a fixed-size hex field.
fn decode_fixed<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], CodecError> {
    let bytes = hex::decode(s).map_err(|source| CodecError::InvalidHex { field, source })?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        field,
        actual,
        expected: N,
    })
}

/// One unit of work from the job server.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkItem {
    data: [u8; WORK_DATA_LEN],
    midstate: [u8; MIDSTATE_LEN],
    header: [u8; HEADER_LEN],
}

impl WorkItem {
    pub fn new(data: [u8; WORK_DATA_LEN], midstate: [u8; MIDSTATE_LEN]) -> Self {
        let header = swap_words(&data);
        Self {
            data,
            midstate,
            header,
        }
    }

    /// Build from the `data` (256 hex chars) and `midstate` (64 hex chars)
    /// fields of a getwork reply.
    pub fn from_hex(data: &str, midstate: &str) -> Result<Self, CodecError> {
        let data = decode_fixed::<WORK_DATA_LEN>("data", data.trim())?;
        let midstate = decode_fixed::<MIDSTATE_LEN>("midstate", midstate.trim())?;
        Ok(Self::new(data, midstate))
    }

    /// Getwork data as received.
    pub fn data(&self) -> &[u8; WORK_DATA_LEN] {
        &self.data
    }

    pub fn midstate(&self) -> &[u8; MIDSTATE_LEN] {
        &self.midstate
    }

    /// Canonical header (word-swapped once at construction).
    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    pub fn hash(&self, nonce: u32) -> [u8; 32] {
        hash(&self.header, nonce)
    }

    /// Verify a counter/witness pair reported by the device.
    pub fn check_nonce(&self, candidate: u32, witness: u32) -> bool {
        let expected = witness.wrapping_add(WITNESS_BIAS);
        NONCE_CHECK_OFFSETS
            .iter()
            .any(|&offset| top_word(&self.hash(candidate.wrapping_add_signed(offset))) == expected)
    }

    pub fn is_golden(&self, nonce: u32) -> bool {
        is_golden(&self.hash(nonce))
    }

    /// Send-work payload: the 12 data bytes that follow the first SHA-256
    /// block, then the midstate.
    pub fn device_payload(&self) -> [u8; DEVICE_PAYLOAD_LEN] {
        let mut payload = [0u8; DEVICE_PAYLOAD_LEN];
        payload[..12].copy_from_slice(&self.data[64..76]);
        payload[12..].copy_from_slice(&self.midstate);
        payload
    }

    /// Getwork data with `nonce` patched in, hex encoded for submission.
    pub fn submission_hex(&self, nonce: u32) -> String {
        let mut data = self.data;
        data[NONCE_POS..NONCE_POS + 4].copy_from_slice(&nonce.to_le_bytes());
        hex::encode(data)
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("header", &hex::encode(self.header))
            .field("midstate", &hex::encode(self.midstate))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data::block_2011;

    fn work() -> WorkItem {
        WorkItem::from_hex(block_2011::DATA, block_2011::MIDSTATE).unwrap()
    }

    #[test]
    fn test_swap_words_produces_canonical_header() {
        assert_eq!(hex::encode(work().header()), block_2011::CANONICAL_HEADER);
    }

    #[test]
    fn test_hash_matches_reference_digest() {
        let digest = work().hash(0);
        assert_eq!(hex::encode(digest), block_2011::DIGEST_NONCE_0);
        assert_eq!(top_word(&digest), 0xdbcf30e2);
    }

    #[test]
    fn test_check_nonce_exact_counter() {
        let work = work();
        assert!(work.check_nonce(0x12345678, 0x0b52d2fb));
        assert!(work.check_nonce(0xdeadbeef, 0x9badc711));
    }

    #[test]
    fn test_check_nonce_tolerates_pipeline_offset() {
        let work = work();
        // Witness of nonce 1 reported alongside counters 0..=3
        assert!(work.check_nonce(0, 0x123f4b0a));
        assert!(work.check_nonce(2, 0x123f4b0a));
        assert!(work.check_nonce(3, 0x123f4b0a));
        // Witness of nonce 0 with the counter wrapped just below it
        assert!(work.check_nonce(u32::MAX, 0x7fee63c9));
    }

    #[test]
    fn test_check_nonce_rejects_outside_window() {
        let work = work();
        // Nonce 1's witness is three steps away from counter 4
        assert!(!work.check_nonce(4, 0x123f4b0a));
        assert!(!work.check_nonce(0x12345678, 0x0b52d2fc));
    }

    #[test]
    fn test_golden_nonce_is_recognized() {
        let work = work();
        assert!(work.is_golden(block_2011::GOLDEN_NONCE));
        assert!(!work.is_golden(0));
        assert!(is_golden(&[0u8; 32]));
    }

    #[test]
    fn test_device_payload_layout() {
        let payload = work().device_payload();
        assert_eq!(hex::encode(&payload[..12]), "cc58b7d64e4056801a08e1e5");
        assert_eq!(hex::encode(&payload[12..]), block_2011::MIDSTATE);
    }

    #[test]
    fn test_submission_patches_nonce_little_endian() {
        let submission = work().submission_hex(0x11223344);
        assert_eq!(submission.len(), 256);
        assert_eq!(&submission[152..160], "44332211");
        assert_eq!(&submission[..152], &block_2011::DATA[..152]);
        assert_eq!(&submission[160..], &block_2011::DATA[160..]);
    }

    #[test]
    fn test_from_hex_rejects_short_data() {
        let err = WorkItem::from_hex(&block_2011::DATA[..254], block_2011::MIDSTATE).unwrap_err();
        assert_eq!(
            err,
            CodecError::InvalidLength {
                field: "data",
                actual: 127,
                expected: 128
            }
        );
    }

    #[test]
    fn test_from_hex_rejects_bad_digits() {
        let bad = block_2011::MIDSTATE.replace('8', "x");
        assert_eq!(
            WorkItem::from_hex(block_2011::DATA, &bad),
            Err(CodecError::InvalidHex {
                field: "midstate",
                source: hex::FromHexError::InvalidHexCharacter { c: 'x', index: 1 },
            })
        );
    }
}
