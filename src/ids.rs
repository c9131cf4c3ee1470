//! Identifier and token generation
//!
//! App/user/job identifiers are a short typed prefix plus 12 base62
//! characters. Session tokens and invite codes are longer, URL-safe, and
//! drawn from the OS RNG.

use rand::{rngs::OsRng, Rng};

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random base62 string of the given length
pub fn base62(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect()
}

/// `app_` + 12 base62 chars; immutable for the lifetime of the app
pub fn app_id() -> String {
    format!("app_{}", base62(12))
}

/// `usr_` + 12 base62 chars
pub fn user_id() -> String {
    format!("usr_{}", base62(12))
}

/// `job_` + 12 base62 chars
pub fn job_id() -> String {
    format!("job_{}", base62(12))
}

/// Server-assigned document id (no prefix, queryable as the `id` field)
pub fn doc_id() -> String {
    base62(12)
}

/// Opaque high-entropy session token (32 base62 chars, ~190 bits)
pub fn session_token() -> String {
    base62(32)
}

/// Invite code; shorter than a session token but still unguessable
pub fn invite_code() -> String {
    base62(20)
}

/// Validate an id of the form `<prefix>_<12 base62>`
pub fn is_valid_id(id: &str, prefix: &str) -> bool {
    match id.strip_prefix(prefix).and_then(|r| r.strip_prefix('_')) {
        Some(rest) => rest.len() == 12 && rest.bytes().all(|b| BASE62.contains(&b)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_ids_have_prefix_and_length() {
        let id = app_id();
        assert!(id.starts_with("app_"));
        assert_eq!(id.len(), 16);
        assert!(is_valid_id(&id, "app"));
    }

    #[test]
    fn tokens_are_unique() {
        let a = session_token();
        let b = session_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn invalid_ids_rejected() {
        assert!(!is_valid_id("app_short", "app"));
        assert!(!is_valid_id("usr_123456789012", "app"));
        assert!(!is_valid_id("app_12345678901!", "app"));
    }
}
