//! CSRF protection
//!
//! Double-submit tokens: every issuance produces a form token and a cookie
//! token, tracked server-side as a pair with an expiry. A request is accepted
//! when its form token is known and unexpired and its cookie token is the one
//! issued alongside it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_FORM_FIELD: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// How often expired tokens are swept: 5 minutes
pub const CSRF_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

const TOKEN_BYTES: usize = 32;

/// Tokens handed to a client
#[derive(Debug, Clone)]
pub struct CsrfTokenPair {
    pub form_token: String,
    pub cookie_token: String,
}

struct IssuedPair {
    cookie_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CsrfProtection {
    inner: Arc<CsrfInner>,
}

struct CsrfInner {
    /// Keyed by form token
    pairs: Mutex<HashMap<String, IssuedPair>>,
    expiration: chrono::Duration,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl CsrfProtection {
    pub fn new(expiration: Duration) -> Self {
        let expiration = chrono::Duration::from_std(expiration)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            inner: Arc::new(CsrfInner {
                pairs: Mutex::new(HashMap::new()),
                expiration,
            }),
        }
    }

    pub fn expiration_secs(&self) -> i64 {
        self.inner.expiration.num_seconds()
    }

    /// Issue a fresh form/cookie token pair
    pub fn issue(&self) -> CsrfTokenPair {
        let pair = CsrfTokenPair {
            form_token: generate_token(),
            cookie_token: generate_token(),
        };
        self.inner.pairs.lock().insert(
            pair.form_token.clone(),
            IssuedPair {
                cookie_token: pair.cookie_token.clone(),
                expires_at: Utc::now() + self.inner.expiration,
            },
        );
        pair
    }

    pub fn validate(&self, presented: &str, cookie: &str) -> bool {
        self.validate_at(presented, cookie, Utc::now())
    }

    /// The form token must be known and unexpired, and the cookie must be its
    /// partner. Tokens stay valid until they expire.
    pub fn validate_at(&self, presented: &str, cookie: &str, now: DateTime<Utc>) -> bool {
        if presented.is_empty() || cookie.is_empty() {
            return false;
        }

        let mut pairs = self.inner.pairs.lock();
        let Some(issued) = pairs.get(presented) else {
            return false;
        };

        if issued.expires_at <= now {
            pairs.remove(presented);
            return false;
        }

        issued.cookie_token.as_bytes().ct_eq(cookie.as_bytes()).into()
    }

    /// Drop expired pairs, returning how many were removed
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut pairs = self.inner.pairs.lock();
        let before = pairs.len();
        pairs.retain(|_, issued| issued.expires_at > now);
        before - pairs.len()
    }

    pub fn pair_count(&self) -> usize {
        self.inner.pairs.lock().len()
    }

    pub fn start_cleanup_task(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(CSRF_SWEEP_INTERVAL_SECS));
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = self.cleanup_expired_at(Utc::now());
                        if removed > 0 {
                            tracing::debug!(removed, "Expired CSRF tokens removed");
                        }
                    }
                }
            }
        })
    }
}
