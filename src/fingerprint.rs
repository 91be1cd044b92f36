use sha2::{Digest, Sha256};

// 8 bytes of the digest, hex-encoded
const FINGERPRINT_LEN: usize = 16;

/// Dedup key for a (text, prompt) pair, also used as the batch custom id.
///
/// The NUL byte keeps ("ab", "c") and ("a", "bc") apart.
pub fn fingerprint(text: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    hex
}
