/// Returned instead of keys too short to show a prefix of.
pub const MASKED_KEY_PLACEHOLDER: &str = "__MASKED__";

const VISIBLE_PREFIX: usize = 8;

pub fn mask_api_key(key: &str) -> String {
    let len = key.chars().count();
    if len > VISIBLE_PREFIX {
        let prefix: String = key.chars().take(VISIBLE_PREFIX).collect();
        format!("{prefix}{}", "*".repeat(len - VISIBLE_PREFIX))
    } else if len > 0 {
        MASKED_KEY_PLACEHOLDER.to_string()
    } else {
        String::new()
    }
}

/// A non-empty prefix followed only by asterisks, or the placeholder.
pub fn is_masked_key(key: &str) -> bool {
    if key == MASKED_KEY_PLACEHOLDER {
        return true;
    }
    match key.find('*') {
        Some(idx) if idx > 0 => key[idx..].chars().all(|c| c == '*'),
        _ => false,
    }
}

/// Keeps the stored key when a client echoes back the masked form.
pub fn resolve_incoming_key(incoming: String, stored: &str) -> String {
    if is_masked_key(&incoming) {
        stored.to_string()
    } else {
        incoming
    }
}
