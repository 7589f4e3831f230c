const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub const CONNECTION_ID_PREFIX: &str = "conn-";
pub const MAILBOX_SLOT_PREFIX: &str = "slot-";
pub const RANDOM_TOKEN_LEN: usize = 12;

/// Lowercase alphanumeric token drawn from the OS random source.
pub fn random_token(len: usize) -> String {
    let mut raw = vec![0u8; len];
    if getrandom::getrandom(&mut raw).is_err() {
        // Entropy source unavailable; fall back to the clock.
        let seed = super::time::now_nanos();
        for (index, byte) in raw.iter_mut().enumerate() {
            *byte = (seed >> ((index % 16) * 8)) as u8 ^ (index as u8).wrapping_mul(31);
        }
    }
    raw.into_iter()
        .map(|byte| TOKEN_ALPHABET[usize::from(byte) % TOKEN_ALPHABET.len()] as char)
        .collect()
}

pub fn new_connection_id() -> String {
    format!("{CONNECTION_ID_PREFIX}{}", random_token(RANDOM_TOKEN_LEN))
}

pub fn new_mailbox_slot() -> String {
    format!("{MAILBOX_SLOT_PREFIX}{}", random_token(RANDOM_TOKEN_LEN))
}

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value == "." || value == ".." {
        return Err(format!("{kind} must not be `.` or `..`"));
    }
    if value
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control() || ch == '/' || ch == '\\')
    {
        return Err(format!(
            "{kind} must not contain whitespace, control characters or path separators"
        ));
    }
    Ok(())
}
