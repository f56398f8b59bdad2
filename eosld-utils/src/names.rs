//! EOSIO name encodings.
//!
//! Actions and notification handlers are dispatched on the chain's 64-bit
//! "name" encoding: a base-32 alphabet packed five bits per character,
//! MSB-first, with a 13th character squeezed into the low four bits.
//! Sync-calls use a separate 64-bit identifier derived by hashing the call
//! name; the receiver runtime computes the same hash on its side, so the
//! function here must not change independently of it.

/// Maps a character to its index in the name alphabet
/// `.12345abcdefghijklmnopqrstuvwxyz`. Characters outside the alphabet fold
/// to zero, matching the chain's encoder.
fn char_to_symbol(c: u8) -> u64 {
    match c {
        b'a'..=b'z' => u64::from(c - b'a') + 6,
        b'1'..=b'5' => u64::from(c - b'1') + 1,
        _ => 0,
    }
}

/// Encodes up to 13 characters of `s` as a 64-bit EOSIO name.
///
/// The first twelve characters occupy five bits each, packed from the most
/// significant bit down; a thirteenth character contributes only its low
/// four alphabet bits.
pub fn string_to_name(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut name = 0u64;
    for (i, &c) in bytes.iter().take(12).enumerate() {
        name |= (char_to_symbol(c) & 0x1f) << (64 - 5 * (i + 1));
    }
    if let Some(&c) = bytes.get(12) {
        name |= char_to_symbol(c) & 0x0f;
    }
    name
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit identifier for a sync-call function name. FNV-1a over the UTF-8
/// bytes; must match the hash the receiver runtime applies to the name
/// carried in the call-data header.
pub fn hash_id(s: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in s.as_bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
