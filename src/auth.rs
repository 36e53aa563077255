//! Credentials: agent passwords, signed session tokens, webhook signatures.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hash_password(plain: &str) -> Option<String> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST).ok()
}

pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

/// Issue a signed agent session token: `agent_id.expiry.hmac_hex`. The agent id
/// is a uuid and the expiry a unix timestamp, so `.` is a safe separator.
pub fn sign_agent_token(secret: &str, agent_id: &str, ttl_seconds: i64) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let exp = Utc::now().timestamp() + ttl_seconds;
    let payload = format!("{agent_id}.{exp}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    Some(format!("{payload}.{sig}"))
}

/// Verify a session token and return the agent id it was issued for.
pub fn verify_agent_token(secret: &str, token: &str) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let parts: Vec<&str> = token.split('.').collect();
    let [agent_id, exp_raw, sig] = parts.as_slice() else {
        return None;
    };
    let exp = exp_raw.parse::<i64>().ok()?;
    if exp < Utc::now().timestamp() {
        return None;
    }
    let Ok(signature_bytes) = hex::decode(sig.trim()) else {
        return None;
    };
    let payload = format!("{agent_id}.{exp}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    if mac.verify_slice(&signature_bytes).is_ok() {
        Some(agent_id.to_string())
    } else {
        None
    }
}

/// Compare the per-request signature header to the account's webhook secret.
/// Both sides go through SHA-256 first so the comparison cost is independent
/// of how long a prefix matches.
pub fn verify_webhook_signature(secret: &str, signature_header: Option<&str>) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    if signature.is_empty() || secret.is_empty() {
        return false;
    }
    Sha256::digest(signature.as_bytes()) == Sha256::digest(secret.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = sign_agent_token("secret", "agent-1", 3600).unwrap();
        assert_eq!(
            verify_agent_token("secret", &token).as_deref(),
            Some("agent-1")
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = sign_agent_token("secret", "agent-1", -10).unwrap();
        assert!(verify_agent_token("secret", &token).is_none());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = sign_agent_token("secret", "agent-1", 3600).unwrap();
        let forged = token.replace("agent-1", "agent-2");
        assert!(verify_agent_token("secret", &forged).is_none());
        assert!(verify_agent_token("other-secret", &token).is_none());
        assert!(verify_agent_token("secret", "garbage").is_none());
    }

    #[test]
    fn webhook_signature_matches_secret_only() {
        assert!(verify_webhook_signature("s3cr3t", Some("s3cr3t")));
        assert!(!verify_webhook_signature("s3cr3t", Some("wrong")));
        assert!(!verify_webhook_signature("s3cr3t", None));
        assert!(!verify_webhook_signature("s3cr3t", Some("")));
        assert!(!verify_webhook_signature("", Some("anything")));
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }
}
