//! Device code and user code generation.
//!
//! The two codes of a request are drawn independently, so neither can be
//! derived from the other.

use base64ct::Encoding;
use rand::{Rng, RngCore};

/// User code alphabet: consonants only. No vowels (no accidental words) and no
/// glyphs that are easy to confuse when read off a screen (0/O, 1/I/L).
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKMNPQRSTVWXZ";
pub const USER_CODE_LEN: usize = 8;
/// 24 random bytes, base64url without padding.
pub const DEVICE_CODE_LEN: usize = 32;

const DEVICE_CODE_BYTES: usize = 24;

/// Generate a fresh `(device_code, user_code)` pair. The user code is returned
/// in normalized form; use [`format_user_code`] for display.
pub fn issue_codes() -> (String, String) {
    (generate_device_code(), generate_user_code())
}

fn generate_device_code() -> String {
    let mut bytes = [0u8; DEVICE_CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// 8 characters from a 19 letter alphabet, ~34 bits.
fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_CODE_LEN)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Strip display formatting and case from a user code.
pub fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Render a normalized user code as `XXXX-XXXX`.
pub fn format_user_code(code: &str) -> String {
    let code = normalize(code);
    if code.len() != USER_CODE_LEN || !code.is_ascii() {
        return code;
    }
    let (head, tail) = code.split_at(USER_CODE_LEN / 2);
    format!("{}-{}", head, tail)
}

/// Accepts both `BCDF-GHJK` and `bcdfghjk`.
pub fn is_valid_user_code(code: &str) -> bool {
    let code = normalize(code);
    code.len() == USER_CODE_LEN && code.bytes().all(|b| USER_CODE_ALPHABET.contains(&b))
}

pub fn is_valid_device_code(code: &str) -> bool {
    code.len() == DEVICE_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
