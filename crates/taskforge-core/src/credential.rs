//! `RunCredential` minting and validation for `claim`: a scoped,
//! HMAC-SHA256 credential handed to a worker alongside a claimed run, valid
//! only for that exact `(taskId, runId)` pair.
//!
//! Same shape as a scoped-agent-token pair: a fixed prefix, an HMAC over the
//! scoped fields, constant-time verification on validate. `taskId`'s fixed
//! 22-character encoding (`taskforge_db::ids::generate_task_id`) plays the
//! role a fixed-width UUID would for prefix parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CREDENTIAL_PREFIX: &str = "taskforge_rc_";
const TASK_ID_LEN: usize = 22;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid credential format: {0}")]
    InvalidFormat(String),
    #[error("invalid run id in credential: {0}")]
    InvalidRunId(String),
    #[error("credential HMAC verification failed")]
    HmacMismatch,
    #[error("missing credential secret")]
    MissingSecret,
}

/// HMAC secret backing every minted credential. A deployment rotating this
/// invalidates every credential in flight, which is acceptable: a worker
/// whose credential no longer validates simply has its next report
/// rejected, covered by the same idempotent-retry path as any other
/// transient worker failure.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub secret: Vec<u8>,
}

impl CredentialConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Load from `TASKFORGE_CREDENTIAL_SECRET`, a hex-encoded string.
    pub fn from_env() -> Result<Self, CredentialError> {
        let secret_hex =
            std::env::var("TASKFORGE_CREDENTIAL_SECRET").map_err(|_| CredentialError::MissingSecret)?;
        let secret = hex::decode(&secret_hex)
            .map_err(|e| CredentialError::InvalidFormat(format!("TASKFORGE_CREDENTIAL_SECRET is not valid hex: {e}")))?;
        Ok(Self::new(secret))
    }
}

/// Claims recovered from a validated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCredentialClaims {
    pub task_id: String,
    pub run_id: i32,
}

/// Mint a credential scoped to `(task_id, run_id)`. Format:
/// `taskforge_rc_<task_id>_<run_id>_<hmac_hex>`, HMAC computed over
/// `<task_id>:<run_id>`.
pub fn generate_credential(config: &CredentialConfig, task_id: &str, run_id: i32) -> String {
    let message = format!("{task_id}:{run_id}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{CREDENTIAL_PREFIX}{task_id}_{run_id}_{hmac_hex}")
}

/// Validate a credential and extract its claims.
pub fn validate_credential(config: &CredentialConfig, credential: &str) -> Result<RunCredentialClaims, CredentialError> {
    let rest = credential
        .strip_prefix(CREDENTIAL_PREFIX)
        .ok_or_else(|| CredentialError::InvalidFormat("credential must start with the expected prefix".to_owned()))?;

    if rest.len() < TASK_ID_LEN + 1 {
        return Err(CredentialError::InvalidFormat(
            "credential too short to contain a taskId".to_owned(),
        ));
    }
    let (task_id, after_task_id) = rest.split_at(TASK_ID_LEN);

    let after_underscore = after_task_id
        .strip_prefix('_')
        .ok_or_else(|| CredentialError::InvalidFormat("expected underscore after taskId".to_owned()))?;

    let (run_id_str, hmac_hex) = after_underscore
        .split_once('_')
        .ok_or_else(|| CredentialError::InvalidFormat("expected underscore between runId and hmac".to_owned()))?;

    let run_id: i32 = run_id_str
        .parse()
        .map_err(|e: std::num::ParseIntError| CredentialError::InvalidRunId(e.to_string()))?;

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| CredentialError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    let message = format!("{task_id}:{run_id}");
    verify_hmac_constant_time(&config.secret, message.as_bytes(), &provided_mac)?;

    Ok(RunCredentialClaims {
        task_id: task_id.to_owned(),
        run_id,
    })
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn verify_hmac_constant_time(key: &[u8], message: &[u8], expected_mac: &[u8]) -> Result<(), CredentialError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac).map_err(|_| CredentialError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CredentialConfig {
        CredentialConfig::new(b"test-secret-for-taskforge".to_vec())
    }

    fn test_task_id() -> &'static str {
        "AAAAAAAAQAAAAAAAAAAAAQ"
    }

    #[test]
    fn generate_and_validate_roundtrip() {
        let config = test_config();
        let token = generate_credential(&config, test_task_id(), 3);
        let claims = validate_credential(&config, &token).unwrap();
        assert_eq!(claims.task_id, test_task_id());
        assert_eq!(claims.run_id, 3);
    }

    #[test]
    fn reject_tampered_hmac() {
        let config = test_config();
        let token = generate_credential(&config, test_task_id(), 1);
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        let result = validate_credential(&config, &tampered);
        assert!(matches!(result, Err(CredentialError::HmacMismatch)));
    }

    #[test]
    fn reject_tampered_run_id() {
        let config = test_config();
        let token = generate_credential(&config, test_task_id(), 1);
        let tampered = token.replacen("_1_", "_2_", 1);
        let result = validate_credential(&config, &tampered);
        assert!(result.is_err());
    }

    #[test]
    fn reject_wrong_secret() {
        let config = test_config();
        let token = generate_credential(&config, test_task_id(), 1);
        let wrong = CredentialConfig::new(b"wrong-secret".to_vec());
        let result = validate_credential(&wrong, &token);
        assert!(matches!(result, Err(CredentialError::HmacMismatch)));
    }

    #[test]
    fn reject_wrong_prefix() {
        let config = test_config();
        assert!(validate_credential(&config, "wrong_prefix_abc").is_err());
    }

    #[test]
    fn reject_truncated_credential() {
        let config = test_config();
        assert!(validate_credential(&config, "taskforge_rc_short").is_err());
    }

    #[test]
    fn different_runs_produce_different_credentials() {
        let config = test_config();
        let c1 = generate_credential(&config, test_task_id(), 1);
        let c2 = generate_credential(&config, test_task_id(), 2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let config = test_config();
        let c1 = generate_credential(&config, test_task_id(), 1);
        let c2 = generate_credential(&config, test_task_id(), 1);
        assert_eq!(c1, c2);
    }
}
