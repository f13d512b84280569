//! Identifier format validation.
//!
//! `taskId`/`taskGroupId` are URL-safe base64 renderings of a 128-bit slug
//! with two version bits forced into fixed positions; the other identifier
//! spaces (`provisionerId`, `workerType`, `workerGroup`, `workerId`,
//! `schedulerId`) are a flat 1-38 char alphanumeric-plus-`-_` token, and
//! artifact names are printable ASCII.

use std::sync::LazyLock;

use regex::Regex;

static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{8}[Q-T][A-Za-z0-9_-][CGKOSWaeimquy26-][A-Za-z0-9_-]{10}[AQgw]$")
        .expect("static task id regex is valid")
});

static GENERIC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-_]{1,38}$").expect("static generic id regex is valid"));

static ARTIFACT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x20-\x7e]+$").expect("static artifact name regex is valid"));

/// Validate a `taskId` or `taskGroupId`.
pub fn is_valid_task_id(id: &str) -> bool {
    TASK_ID_RE.is_match(id)
}

/// Validate `provisionerId`, `workerType`, `workerGroup`, `workerId`, or
/// `schedulerId`.
pub fn is_valid_generic_id(id: &str) -> bool {
    GENERIC_ID_RE.is_match(id)
}

/// Validate an artifact name.
pub fn is_valid_artifact_name(name: &str) -> bool {
    ARTIFACT_NAME_RE.is_match(name)
}

/// Generate a fresh, valid `taskId`/`taskGroupId` for callers (e.g. the CLI)
/// that need to mint one rather than receive it from a scheduler.
///
/// Produces 22 URL-safe base64 characters with the two version-bit
/// positions forced to satisfy [`is_valid_task_id`]: position 8 from
/// `Q-T`, position 20 from `A`/`Q`/`g`/`w` (the four values base64's
/// alphabet uses to encode `00`/`01`/`10`/`11` in the top two bits of the
/// 21st sextet), and position 18 restricted to the regex's allowed set.
pub fn generate_task_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    const POS8: &[u8] = b"QRST";
    const POS18: &[u8] = b"CGKOSWaeimquy26-";
    const POS20: &[u8] = b"AQgw";

    let mut rng = rand::rng();
    let mut chars: Vec<u8> = (0..22)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())])
        .collect();
    chars[8] = POS8[rng.random_range(0..POS8.len())];
    chars[18] = POS18[rng.random_range(0..POS18.len())];
    chars[20] = POS20[rng.random_range(0..POS20.len())];

    let id = String::from_utf8(chars).expect("alphabet is ASCII");
    debug_assert!(is_valid_task_id(&id));
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_task_ids_validate() {
        for _ in 0..200 {
            let id = generate_task_id();
            assert!(is_valid_task_id(&id), "generated id failed validation: {id}");
        }
    }

    #[test]
    fn generic_id_bounds() {
        assert!(is_valid_generic_id("a"));
        assert!(is_valid_generic_id(&"a".repeat(38)));
        assert!(!is_valid_generic_id(""));
        assert!(!is_valid_generic_id(&"a".repeat(39)));
        assert!(!is_valid_generic_id("has space"));
    }

    #[test]
    fn artifact_name_printable_ascii_only() {
        assert!(is_valid_artifact_name("public/log.txt"));
        assert!(!is_valid_artifact_name(""));
        assert!(!is_valid_artifact_name("tab\there"));
        assert!(!is_valid_artifact_name("emoji-🎉"));
    }

    #[test]
    fn rejects_malformed_task_ids() {
        assert!(!is_valid_task_id("too-short"));
        assert!(!is_valid_task_id(""));
    }
}
