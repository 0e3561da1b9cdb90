//! Device and user code generation.
//!
//! Device codes are long bearer capabilities that never leave the requesting
//! device. User codes are short enough to type from a TV screen, so they are
//! guessable within the TTL window; the short lifetime and single use are what
//! protect them, not their length.

use super::error::DeviceAuthError;
use rand::rngs::OsRng;
use rand::RngCore;

/// 32 bytes, 64 hex characters.
pub const DEVICE_CODE_BYTES: usize = 32;
/// 4 bytes, 8 hex characters, displayed as `XXXX-XXXX`.
pub const USER_CODE_BYTES: usize = 4;

const GROUP_LEN: usize = 4;

/// Source of fresh device and user codes.
///
/// User codes are returned in canonical form (lowercase, no separators).
pub trait CodeGenerator: Send + Sync {
    fn new_device_code(&self) -> Result<String, DeviceAuthError>;
    fn new_user_code(&self) -> Result<String, DeviceAuthError>;
}

/// Hex codes drawn from the operating system CSPRNG.
#[derive(Debug, Clone)]
pub struct OsCodeGenerator {
    device_code_bytes: usize,
    user_code_bytes: usize,
}

impl OsCodeGenerator {
    pub fn new(device_code_bytes: usize, user_code_bytes: usize) -> Self {
        Self {
            device_code_bytes,
            user_code_bytes,
        }
    }
}

impl Default for OsCodeGenerator {
    fn default() -> Self {
        Self::new(DEVICE_CODE_BYTES, USER_CODE_BYTES)
    }
}

impl CodeGenerator for OsCodeGenerator {
    fn new_device_code(&self) -> Result<String, DeviceAuthError> {
        random_hex(self.device_code_bytes)
    }

    fn new_user_code(&self) -> Result<String, DeviceAuthError> {
        random_hex(self.user_code_bytes)
    }
}

fn random_hex(len: usize) -> Result<String, DeviceAuthError> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| DeviceAuthError::Internal(format!("entropy source unavailable: {e}")))?;
    Ok(hex::encode(bytes))
}

/// Format a canonical user code for display: `a1b2c3d4` becomes `A1B2-C3D4`.
pub fn format_user_code(code: &str) -> String {
    let upper = code.to_uppercase();
    if upper.chars().count() < 2 * GROUP_LEN {
        return upper;
    }

    let chars: Vec<char> = upper.chars().collect();
    chars
        .chunks(GROUP_LEN)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical lookup form of a user-entered code: separators and whitespace
/// stripped, lowercased.
pub fn normalize_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Normalize and reject input that cannot possibly be a user code of
/// `expected_len` hex characters.
pub fn validate_user_code(input: &str, expected_len: usize) -> Result<String, DeviceAuthError> {
    let code = normalize_user_code(input);
    if code.is_empty() {
        return Err(DeviceAuthError::InvalidInput(
            "user_code is required".to_string(),
        ));
    }
    if code.len() != expected_len || !code.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DeviceAuthError::InvalidInput(
            "user_code is malformed".to_string(),
        ));
    }
    Ok(code)
}
