//! Test vectors from real getwork data.

/// Main-net block 00000000a2c21b3f…b429 from 2011, as a getwork server
/// would have served it.
///
/// `DATA` and `MIDSTATE` are the hex fields of the getwork reply. The data
/// holds the 80-byte header with every 32-bit word byte-swapped, followed by
/// SHA-256 padding for the second block. `CANONICAL_HEADER` is the same
/// header after swapping the words back, with the nonce zeroed. The nonce
/// the block was mined with is `GOLDEN_NONCE`; its double SHA-256 is the
/// block hash, which has 32 leading zero bits.
pub mod block_2011 {
    use crate::codec::WorkItem;

    pub const DATA: &str = "0000000122f3e795bb7a55b2b4a580e0dbba9f2a5aedbfc566632984000008de00000000e951667fbba0cfae7719ab2fb4ab8d291a20d387782f4610297f5899cc58b7d64e4056801a08e1e500000000000000800000000000000000000000000000000000000000000000000000000000000000000000000000000080020000";

    pub const MIDSTATE: &str = "28b81bd40a0e1b75d18362cb9a2faa61669d42913f26194f776c349e97559190";

    pub const CANONICAL_HEADER: &str = "0100000095e7f322b2557abbe080a5b42a9fbadbc5bfed5a84296366de080000000000007f6651e9aecfa0bb2fab1977298dabb487d3201a10462f7899587f29d6b758cc8056404ee5e1081a00000000";

    /// Double SHA-256 of the canonical header with nonce 0, in digest byte
    /// order.
    pub const DIGEST_NONCE_0: &str = "16150913280908061911a0a2f622a130788495fc125a7faab9387976dbcf30e2";

    pub const GOLDEN_NONCE: u32 = 0x5eee3244;

    /// Block hash in display order (reversed digest).
    pub const BLOCK_HASH: &str = "00000000a2c21b3f3dd78f74418b9a3183c3e62d894bcc6412dde3fb46f0b429";

    pub fn work() -> WorkItem {
        WorkItem::from_hex(DATA, MIDSTATE).unwrap()
    }
}

mod tests {
    use super::block_2011;

    #[test]
    fn test_golden_nonce_hashes_to_block_hash() {
        let mut digest = block_2011::work().hash(block_2011::GOLDEN_NONCE);
        digest.reverse();
        assert_eq!(hex::encode(digest), block_2011::BLOCK_HASH);
    }
}
