/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Number of hash slots in a cluster keyspace.
pub const SLOT_COUNT: u16 = 16384;

/// Map a key to its cluster slot, honoring `{tag}` hash tags.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(trim_hash_tag(key)) % SLOT_COUNT
}

/// Trim a key down to its `{tag}` segment per the cluster key-routing rules.
///
/// Only the first `{` and the first `}` after it count, and an empty tag
/// (`foo{}bar`) leaves the key untouched.
pub fn trim_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(begin) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                let start = begin + 1;
                return &key[start..start + offset];
            }
        }
    }
    key
}
