//! Operator authentication: rate-limited password proof and short-lived
//! JWTs.
//!
//! The client proves knowledge of the shared secret by sending
//! `bcrypt("<unixSec/10><secret>")`; the coarse timestamp bounds replay.
//! Failures are counted per client IP in the keyed store; five failures
//! lock the IP for ten minutes.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{OmError, OmResult};
use crate::store::{KvStore, Store};

const MAX_FAILURES: u32 = 5;
const LOCK_SECS: i64 = 600;
const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoginCount {
    count: u32,
    #[serde(rename = "lock_time")]
    lock_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub fn is_om_user(user_id: &str) -> bool {
    user_id.starts_with("OM")
}

pub struct AuthGuard {
    secret: String,
    kv: KvStore,
}

impl AuthGuard {
    pub fn new(secret: impl Into<String>, store: &Store) -> Self {
        Self {
            secret: secret.into(),
            kv: store.kv(),
        }
    }

    fn counter_key(user: &str) -> String {
        format!("loginErrCount:{user}")
    }

    /// Exchange a bcrypt password proof for a bearer token.
    pub fn connect(&self, ip: &str, pwd_hash: &str) -> OmResult<String> {
        self.connect_at(ip, pwd_hash, chrono::Utc::now().timestamp())
    }

    /// Clock-injected variant of [`connect`](Self::connect).
    pub fn connect_at(&self, ip: &str, pwd_hash: &str, now: i64) -> OmResult<String> {
        if self.secret.is_empty() {
            return Err(OmError::verify("Connection rejected"));
        }
        let user = format!("OM-{ip}");
        let key = Self::counter_key(&user);
        let mut counter: LoginCount = self.kv.get(&key).ok().flatten().unwrap_or_default();

        if counter.count >= MAX_FAILURES {
            if now < counter.lock_time {
                return Err(OmError::verify(format!(
                    "Connection rejected, please try again after {} minutes",
                    (counter.lock_time - now) / 60 + 1
                )));
            }
            counter = LoginCount::default();
            let _ = self.kv.set(&key, &counter);
        }

        let expected = format!("{}{}", now / 10, self.secret);
        if !bcrypt::verify(&expected, pwd_hash).unwrap_or(false) {
            counter.count += 1;
            if counter.count >= MAX_FAILURES {
                counter.lock_time = now + LOCK_SECS;
                let _ = self.kv.set(&key, &counter);
                return Err(OmError::verify(format!(
                    "Connection rejected, please try again after {} minutes",
                    (counter.lock_time - now) / 60 + 1
                )));
            }
            let _ = self.kv.set(&key, &counter);
            return Err(OmError::verify(format!(
                "Login failed, {} attempts left",
                MAX_FAILURES - counter.count
            )));
        }

        let _ = self.kv.delete(&key);
        self.issue_token(&user, now)
    }

    fn issue_token(&self, user: &str, now: i64) -> OmResult<String> {
        let claims = Claims {
            sub: user.to_string(),
            exp: now + TOKEN_TTL_SECS,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| OmError::sys(format!("issue token: {e}")))
    }

    /// Validate a bearer token and return its user id.
    pub fn verify_token(&self, token: &str) -> OmResult<String> {
        if self.secret.is_empty() {
            return Err(OmError::verify("Connection rejected"));
        }
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| OmError::verify("invalid token"))?;
        if !is_om_user(&data.claims.sub) {
            return Err(OmError::verify("forbidden"));
        }
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(secret: &str) -> AuthGuard {
        AuthGuard::new(secret, &Store::in_memory().unwrap())
    }

    fn proof(secret: &str, now: i64) -> String {
        bcrypt::hash(format!("{}{}", now / 10, secret), 4).unwrap()
    }

    #[test]
    fn test_connect_success_issues_token() {
        let guard = guard("s3cret");
        // token expiry is validated against the real clock
        let now = chrono::Utc::now().timestamp();
        let token = guard.connect_at("10.0.0.1", &proof("s3cret", now), now).unwrap();
        let user = guard.verify_token(&token).unwrap();
        assert_eq!(user, "OM-10.0.0.1");
    }

    #[test]
    fn test_empty_secret_rejects() {
        let guard = guard("");
        assert!(guard.connect_at("ip", "x", 0).is_err());
        assert!(guard.verify_token("x").is_err());
    }

    #[test]
    fn test_wrong_password_counts_down() {
        let guard = guard("s3cret");
        let now = 1_700_000_000;
        let err = guard.connect_at("ip", "not-a-hash", now).unwrap_err();
        assert!(err.to_string().contains("4 attempts left"));
        let err = guard.connect_at("ip", "not-a-hash", now).unwrap_err();
        assert!(err.to_string().contains("3 attempts left"));
    }

    #[test]
    fn test_lockout_after_five_failures() {
        let guard = guard("s3cret");
        let now = chrono::Utc::now().timestamp();
        for _ in 0..4 {
            let _ = guard.connect_at("ip", "bad", now);
        }
        let err = guard.connect_at("ip", "bad", now).unwrap_err();
        // lock_time = now + 600 → (600 / 60) + 1
        assert!(err.to_string().contains("try again after 11 minutes"));

        // even the right password is rejected while locked
        let err = guard
            .connect_at("ip", &proof("s3cret", now + 60), now + 60)
            .unwrap_err();
        assert!(err.to_string().contains("try again"));

        // lock expires and the counter resets
        let later = now + LOCK_SECS + 61;
        let token = guard.connect_at("ip", &proof("s3cret", later), later).unwrap();
        assert!(guard.verify_token(&token).is_ok());
    }

    #[test]
    fn test_failures_tracked_per_ip() {
        let guard = guard("s3cret");
        let now = chrono::Utc::now().timestamp();
        for _ in 0..5 {
            let _ = guard.connect_at("ip-a", "bad", now);
        }
        // ip-b unaffected
        let token = guard.connect_at("ip-b", &proof("s3cret", now), now).unwrap();
        assert!(guard.verify_token(&token).is_ok());
    }

    #[test]
    fn test_success_clears_counter() {
        let guard = guard("s3cret");
        let now = 1_700_000_000;
        let _ = guard.connect_at("ip", "bad", now);
        let _ = guard.connect_at("ip", &proof("s3cret", now), now).unwrap();
        // failure count restarts from scratch
        let err = guard.connect_at("ip", "bad", now).unwrap_err();
        assert!(err.to_string().contains("4 attempts left"));
    }

    #[test]
    fn test_stale_time_window_rejected() {
        let guard = guard("s3cret");
        let now = 1_700_000_000;
        // proof built for a different 10-second window
        let stale = proof("s3cret", now - 60);
        assert!(guard.connect_at("ip", &stale, now).is_err());
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let a = guard("secret-a");
        let b = guard("secret-b");
        let now = chrono::Utc::now().timestamp();
        let token = a.connect_at("ip", &proof("secret-a", now), now).unwrap();
        assert!(b.verify_token(&token).is_err());
    }

    #[test]
    fn test_is_om_user() {
        assert!(is_om_user("OM-1.2.3.4"));
        assert!(!is_om_user("user-1"));
    }
}
