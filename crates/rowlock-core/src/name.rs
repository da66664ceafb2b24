//! Lock key encoding and validation.
//!
//! Lock keys are stored in a bounded `lock_key` column. Keys that fit are used
//! verbatim (they are case-sensitive); longer keys keep as much of their
//! prefix as possible followed by a hash of the full key.

use sha2::{Digest, Sha512};

use crate::error::{LockError, LockResult};

/// Default width of the `lock_key` column.
pub const MAX_KEY_LENGTH: usize = 255;

/// Encodes `name` so that it fits into a key column of `max_len` bytes.
///
/// Returns `InvalidName` for empty names.
pub fn encode_lock_key(name: &str, max_len: usize) -> LockResult<String> {
    if name.is_empty() {
        return Err(LockError::InvalidName("lock key must not be empty".to_string()));
    }
    Ok(to_safe_name(name, max_len, compute_hash))
}

/// Computes a Base32 hash of the input bytes.
///
/// Uses SHA512 truncated to 160 bits (32 Base32 characters).
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    let hash_bytes = hasher.finalize();

    const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    const HASH_LENGTH_IN_CHARS: usize = 160 / 5;

    let mut chars = String::with_capacity(HASH_LENGTH_IN_CHARS);
    let mut byte_index = 0;
    let mut bit_buffer = 0u32;
    let mut bits_remaining = 0;

    for _ in 0..HASH_LENGTH_IN_CHARS {
        if bits_remaining < 5 && byte_index < 20 {
            bit_buffer |= (hash_bytes[byte_index] as u32) << bits_remaining;
            bits_remaining += 8;
            byte_index += 1;
        }

        chars.push(BASE32_ALPHABET[(bit_buffer & 31) as usize] as char);
        bit_buffer >>= 5;
        bits_remaining -= 5;
    }

    chars
}

fn to_safe_name(name: &str, max_len: usize, hash: impl Fn(&[u8]) -> String) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }

    let name_hash = hash(name.as_bytes());
    if name_hash.len() >= max_len {
        return name_hash[..max_len].to_string();
    }

    // Cut the prefix on a char boundary so multi-byte keys stay valid UTF-8.
    let budget = max_len - name_hash.len() - 1;
    let mut cut = budget.min(name.len());
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}#{}", &name[..cut], name_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_pass_through() {
        assert_eq!(encode_lock_key("lock:order:42", MAX_KEY_LENGTH).unwrap(), "lock:order:42");
        assert_eq!(encode_lock_key("Shop:Cache", MAX_KEY_LENGTH).unwrap(), "Shop:Cache");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            encode_lock_key("", MAX_KEY_LENGTH),
            Err(LockError::InvalidName(_))
        ));
    }

    #[test]
    fn long_keys_are_hashed_to_fit() {
        let long_key = format!("lock:order:{}", "9".repeat(400));
        let encoded = encode_lock_key(&long_key, MAX_KEY_LENGTH).unwrap();
        assert_eq!(encoded.len(), MAX_KEY_LENGTH);
        assert!(encoded.starts_with("lock:order:"));

        let other = format!("lock:order:{}8", "9".repeat(399));
        assert_ne!(encode_lock_key(&other, MAX_KEY_LENGTH).unwrap(), encoded);
    }

    #[test]
    fn multibyte_prefix_is_cut_on_char_boundary() {
        let key = "锁".repeat(100);
        let encoded = encode_lock_key(&key, 64).unwrap();
        assert!(encoded.len() <= 64);
        assert!(encoded.contains('#'));
    }

    #[test]
    fn tiny_columns_get_a_truncated_hash() {
        let encoded = encode_lock_key("a-key-longer-than-sixteen", 16).unwrap();
        assert_eq!(encoded.len(), 16);
        assert!(!encoded.contains('#'));
    }
}
