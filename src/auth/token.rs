//! Bearer-token acquisition against a registry's token endpoint, with a
//! TTL-bounded in-process cache keyed by the parsed challenge.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::challenge::Challenge;
use crate::http::upstream;

/// Fallback lifetime for tokens whose endpoint does not report `expires_in`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Token-endpoint response (`GET <realm>?scope=...&service=...`).
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub issued_at: String,
}

// ---------------------------------------------------------------------------
// TokenCache
// ---------------------------------------------------------------------------

/// Challenge-keyed token cache. Stale entries are dropped on lookup and
/// re-fetched on demand.
pub struct TokenCache {
    entries: Mutex<HashMap<Challenge, (Token, Instant)>>,
    default_ttl: Duration,
}

impl TokenCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn get(&self, challenge: &Challenge) -> Option<Token> {
        let mut entries = self.entries.lock();
        match entries.get(challenge) {
            Some((token, expires_at)) if Instant::now() < *expires_at => Some(token.clone()),
            Some(_) => {
                entries.remove(challenge);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, challenge: Challenge, token: Token) {
        let ttl = if token.expires_in > 0 {
            Duration::from_secs(token.expires_in as u64)
        } else {
            self.default_ttl
        };
        self.entries
            .lock()
            .insert(challenge, (token, Instant::now() + ttl));
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Return a bearer token for `challenge`, from cache when fresh, otherwise
/// fetched from the challenge's realm endpoint.
pub async fn acquire(
    client: &reqwest::Client,
    cache: &TokenCache,
    challenge: &Challenge,
    timeout: Duration,
) -> Result<String> {
    if let Some(token) = cache.get(challenge) {
        debug!(realm = %challenge.realm, "token cache hit");
        return Ok(token.token);
    }
    let token = fetch_token(client, challenge, timeout).await?;
    let value = token.token.clone();
    cache.insert(challenge.clone(), token);
    Ok(value)
}

/// `GET <realm>?scope=<scope>&service=<service>`, expecting a JSON body.
pub async fn fetch_token(
    client: &reqwest::Client,
    challenge: &Challenge,
    timeout: Duration,
) -> Result<Token> {
    let resp = client
        .get(&challenge.realm)
        .query(&[
            ("scope", challenge.scope.as_str()),
            ("service", challenge.service.as_str()),
        ])
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("token request to {}", challenge.realm))?;

    if resp.status() != StatusCode::OK {
        return Err(upstream::response_as_error(resp).await)
            .context("token endpoint refused the request");
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let essence = content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_owned())
        .unwrap_or_default();
    anyhow::ensure!(
        essence == mime::APPLICATION_JSON.essence_str(),
        "unexpected token content type {content_type:?}"
    );

    let token: Token = resp.json().await.context("decode token response")?;
    debug!(realm = %challenge.realm, expires_in = token.expires_in, "fetched registry token");
    Ok(token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(realm: &str) -> Challenge {
        Challenge {
            scheme: "Bearer".to_string(),
            realm: realm.to_string(),
            service: "registry.test".to_string(),
            scope: "repository:foo:pull".to_string(),
        }
    }

    fn token(value: &str, expires_in: i64) -> Token {
        Token {
            token: value.to_string(),
            expires_in,
            issued_at: String::new(),
        }
    }

    #[test]
    fn cache_returns_fresh_tokens() {
        let cache = TokenCache::new(DEFAULT_TOKEN_TTL);
        cache.insert(challenge("https://auth.test/token"), token("abc", 60));
        let got = cache.get(&challenge("https://auth.test/token")).unwrap();
        assert_eq!(got.token, "abc");
    }

    #[test]
    fn cache_misses_on_different_challenge() {
        let cache = TokenCache::new(DEFAULT_TOKEN_TTL);
        cache.insert(challenge("https://auth.test/token"), token("abc", 60));
        assert!(cache.get(&challenge("https://other.test/token")).is_none());
    }

    #[test]
    fn stale_entries_are_dropped() {
        // Zero default TTL, no expires_in: the entry is stale immediately.
        let cache = TokenCache::new(Duration::ZERO);
        cache.insert(challenge("https://auth.test/token"), token("abc", 0));
        assert!(cache.get(&challenge("https://auth.test/token")).is_none());
        // And it was removed, not just skipped.
        assert!(cache.entries.lock().is_empty());
    }

    #[test]
    fn token_decodes_with_extra_fields() {
        let token: Token = serde_json::from_str(
            r#"{"token":"tk","expires_in":300,"issued_at":"2024-01-01T00:00:00Z","access_token":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(token.token, "tk");
        assert_eq!(token.expires_in, 300);
        assert_eq!(token.issued_at, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn token_decodes_with_missing_optional_fields() {
        let token: Token = serde_json::from_str(r#"{"token":"tk"}"#).unwrap();
        assert_eq!(token.expires_in, 0);
        assert_eq!(token.issued_at, "");
    }
}
