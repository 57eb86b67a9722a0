//! Durable idempotency markers for exactly-once initialization.
//!
//! A marker records that a request with a given `(key, scope)` pair has
//! been executed (or is executing), together with the cached response to
//! replay. The uniqueness of the marker row is the *sole* mutual-exclusion
//! mechanism preventing duplicate initialization under concurrent identical
//! requests; no external lock is involved.
//!
//! ## Two-phase protocol
//!
//! 1. `InProgress` — claimed before running the computation
//! 2. `Committed` — finalized with the cached response after success
//!
//! A failed computation *deletes* its marker: failures are never cached, so
//! the next identical request retries fully. A crashed writer leaves a
//! stale `InProgress` marker which becomes claimable again after a takeover
//! timeout.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::store::{IdempotencyClaim, Store};

/// Status of an idempotency marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    /// Claimed; the computation is running.
    InProgress,
    /// Finalized; the cached response is replayed to duplicates.
    Committed,
}

/// Durable idempotency marker for request deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyMarker {
    /// Current status of this marker.
    pub status: MarkerStatus,

    /// The raw idempotency key from the request.
    pub key: String,

    /// The scope the key applies to (e.g. `"course.initialize"`).
    pub scope: String,

    /// SHA-256 hash of `(scope, key)`, the marker's storage identity.
    pub key_hash: String,

    /// SHA-256 hash of the request payload, used to detect key reuse with
    /// a different request.
    pub request_hash: String,

    /// Cached response (only set for `Committed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// When this marker was claimed.
    pub started_at: DateTime<Utc>,

    /// When the computation was committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,

    /// When this marker expires and may be purged.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyMarker {
    /// Computes the SHA-256 storage hash for a `(key, scope)` pair.
    #[must_use]
    pub fn hash_key(key: &str, scope: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes the SHA-256 fingerprint of a request payload.
    #[must_use]
    pub fn hash_request(payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Creates a new in-progress marker.
    #[must_use]
    pub fn new_in_progress(
        key: impl Into<String>,
        scope: impl Into<String>,
        request_hash: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let key = key.into();
        let scope = scope.into();
        let key_hash = Self::hash_key(&key, &scope);
        let now = Utc::now();
        Self {
            status: MarkerStatus::InProgress,
            key,
            scope,
            key_hash,
            request_hash: request_hash.into(),
            response: None,
            started_at: now,
            committed_at: None,
            expires_at: now + ttl,
        }
    }

    /// Finalizes the marker as committed with the cached response.
    #[must_use]
    pub fn finalize_committed(mut self, response: Value, ttl: Duration) -> Self {
        let now = Utc::now();
        self.status = MarkerStatus::Committed;
        self.response = Some(response);
        self.committed_at = Some(now);
        self.expires_at = now + ttl;
        self
    }

    /// Returns whether this marker has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns whether an in-progress marker can be taken over (its creator
    /// is presumed crashed).
    #[must_use]
    pub fn is_stale(&self, takeover: Duration, now: DateTime<Utc>) -> bool {
        self.status == MarkerStatus::InProgress && self.started_at + takeover < now
    }
}

/// Tunables for [`resolve`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// How long committed markers live before they may be purged.
    pub ttl: Duration,
    /// How old an in-progress marker must be before takeover.
    pub stale_takeover: Duration,
    /// How long to sleep between wait-and-re-read rounds.
    pub wait_interval: std::time::Duration,
    /// How many wait rounds before giving up with `IdempotencyTimeout`.
    pub max_waits: u32,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            stale_takeover: Duration::minutes(10),
            wait_interval: std::time::Duration::from_millis(50),
            max_waits: 200,
        }
    }
}

/// A resolved result, with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    /// The result value.
    pub value: T,
    /// True when the value was replayed from a committed marker rather
    /// than computed by this call.
    pub replayed: bool,
}

/// Executes `compute` at most once per `(key, scope)`.
///
/// - A committed, non-expired marker short-circuits with the cached
///   response.
/// - Otherwise this call claims the marker and runs `compute`; on success
///   the serialized result is committed for replay, on failure the marker
///   is deleted so the next call retries fully.
/// - A fresh in-progress marker from a concurrent caller is waited on
///   (bounded), then its committed response is replayed.
///
/// # Errors
///
/// - [`Error::IdempotencyKeyReuse`] when the key exists with a different
///   request fingerprint.
/// - [`Error::IdempotencyTimeout`] when the concurrent holder did not
///   finish within the wait budget.
/// - Whatever `compute` fails with (after the marker is deleted).
#[tracing::instrument(skip(store, request_hash, options, compute), fields(scope = scope))]
pub async fn resolve<S, T, F, Fut>(
    store: &S,
    key: &str,
    scope: &str,
    request_hash: &str,
    options: &ResolveOptions,
    compute: F,
) -> Result<Resolved<T>>
where
    S: Store + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let key_hash = IdempotencyMarker::hash_key(key, scope);

    for round in 0..=options.max_waits {
        let marker =
            IdempotencyMarker::new_in_progress(key, scope, request_hash, options.ttl);
        let now = Utc::now();
        match store
            .claim_idempotency(marker, options.stale_takeover, now)
            .await?
        {
            IdempotencyClaim::Claimed => {
                let value = match compute().await {
                    Ok(value) => value,
                    Err(e) => {
                        // Failures are never cached; the next call retries.
                        store.delete_idempotency(&key_hash).await?;
                        return Err(e);
                    }
                };
                let response = serde_json::to_value(&value)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                store
                    .commit_idempotency(&key_hash, response, options.ttl)
                    .await?;
                return Ok(Resolved {
                    value,
                    replayed: false,
                });
            }
            IdempotencyClaim::Committed(existing) => {
                if existing.request_hash != request_hash {
                    return Err(Error::IdempotencyKeyReuse { key: key.into() });
                }
                let response = existing.response.ok_or_else(|| {
                    Error::storage("committed idempotency marker has no cached response")
                })?;
                let value = serde_json::from_value(response)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                return Ok(Resolved {
                    value,
                    replayed: true,
                });
            }
            IdempotencyClaim::InProgress => {
                if round == options.max_waits {
                    break;
                }
                tokio::time::sleep(options.wait_interval).await;
            }
        }
    }

    Err(Error::IdempotencyTimeout { key: key.into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_key_is_deterministic_and_scope_sensitive() {
        let a = IdempotencyMarker::hash_key("k1", "course.initialize");
        let b = IdempotencyMarker::hash_key("k1", "course.initialize");
        let c = IdempotencyMarker::hash_key("k1", "course.cancel");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn marker_lifecycle() {
        let marker = IdempotencyMarker::new_in_progress(
            "k1",
            "course.initialize",
            "hash",
            Duration::hours(1),
        );
        assert_eq!(marker.status, MarkerStatus::InProgress);
        assert!(marker.response.is_none());

        let committed = marker.finalize_committed(json!({"ok": true}), Duration::hours(1));
        assert_eq!(committed.status, MarkerStatus::Committed);
        assert!(committed.committed_at.is_some());
        assert_eq!(committed.response, Some(json!({"ok": true})));
    }

    #[test]
    fn staleness_boundaries() {
        let mut marker = IdempotencyMarker::new_in_progress(
            "k1",
            "course.initialize",
            "hash",
            Duration::hours(1),
        );
        let takeover = Duration::minutes(10);
        let now = Utc::now();

        marker.started_at = now - takeover - Duration::seconds(1);
        assert!(marker.is_stale(takeover, now));

        marker.started_at = now - takeover + Duration::seconds(30);
        assert!(!marker.is_stale(takeover, now));

        // Committed markers are never stale, only expired.
        let committed = marker.finalize_committed(json!({}), Duration::hours(1));
        assert!(!committed.is_stale(takeover, now + Duration::hours(2)));
        assert!(committed.is_expired(Utc::now() + Duration::hours(2)));
    }

    #[test]
    fn request_hash_differs_for_different_payloads() {
        let a = IdempotencyMarker::hash_request(&json!({"title": "A"}));
        let b = IdempotencyMarker::hash_request(&json!({"title": "B"}));
        assert_ne!(a, b);
    }
}
