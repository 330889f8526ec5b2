const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LENGTH: usize = 22;

// Resource ID prefixes
pub const SANDBOX_PREFIX: &str = "sb_";
pub const WORKER_PREFIX: &str = "wrk_";
pub const TOKEN_PREFIX: &str = "osb_tok_";

/// Encode 16 bytes as a fixed-length 22-character base62 string.
pub fn base62_encode(bytes: &[u8; 16]) -> String {
    let mut num = u128::from_be_bytes(*bytes);
    let mut chars = [b'0'; ENCODED_LENGTH];

    for i in (0..ENCODED_LENGTH).rev() {
        chars[i] = ALPHABET[(num % 62) as usize];
        num /= 62;
    }

    String::from_utf8(chars.to_vec()).unwrap()
}

/// Generate a prefixed ID: `{prefix}{base62(uuidv7)}`
pub fn generate_id(prefix: &str) -> String {
    format!("{}{}", prefix, base62_encode(uuid::Uuid::now_v7().as_bytes()))
}

/// Generate a scoped connect token: `osb_tok_` + 32 hex chars.
pub fn generate_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_length() {
        let id = generate_id(SANDBOX_PREFIX);
        assert!(id.starts_with("sb_"));
        assert_eq!(id.len(), SANDBOX_PREFIX.len() + ENCODED_LENGTH);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id(SANDBOX_PREFIX);
        let b = generate_id(SANDBOX_PREFIX);
        assert_ne!(a, b);
    }

    #[test]
    fn base62_zero_bytes() {
        let encoded = base62_encode(&[0u8; 16]);
        assert_eq!(encoded, "0".repeat(ENCODED_LENGTH));
    }

    #[test]
    fn base62_is_sortable_by_time() {
        // UUIDv7 is time-ordered; base62 on big-endian bytes preserves order.
        let a = base62_encode(uuid::Uuid::now_v7().as_bytes());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = base62_encode(uuid::Uuid::now_v7().as_bytes());
        assert!(a < b);
    }

    #[test]
    fn tokens_have_expected_shape() {
        let token = generate_token();
        assert!(token.starts_with("osb_tok_"));
        let hex_part = &token[TOKEN_PREFIX.len()..];
        assert_eq!(hex_part.len(), 32);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
