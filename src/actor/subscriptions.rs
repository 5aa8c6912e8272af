// Subscriptions source - cache-through resolution of gateway access tokens.
//
// Tokens carrying this source's prefix are resolved against the identity
// service and the result is cached as a serialized Actor, keyed by a SHA-256
// digest of the token (raw tokens never appear in cache keys or logs).
// Staleness lives in the cached `last_updated` timestamp, not in the cache:
//
// - fresh cache hit: returned without any upstream call
// - stale hit or miss: one refetch per resolve call
// - failed refetch: a negative actor (no entitlement) is cached anyway, which
//   bounds upstream load from floods of invalid tokens, and the error is
//   still returned so the current request fails authentication
//
// Negative entries go stale on a much shorter interval than positive ones so
// a token that later becomes valid is not locked out for a day.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::identity::{SubscriptionState, SubscriptionsClient};

use super::cache::Cache;
use super::{Actor, ActorSource, RateLimit, Resolution, SourceSyncer};

/// Source name used for event attribution and update routing.
pub const SOURCE_NAME: &str = "subscriptions";

/// Staleness and debounce policy for cached actors.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Tokens must carry this prefix for the source to claim them.
    pub token_prefix: String,
    /// Cached actors older than this are refetched on resolve.
    pub default_update_interval: Duration,
    /// `update` is a no-op for actors younger than this.
    pub min_update_interval: Duration,
    /// Staleness interval for negative entries (failed resolutions).
    pub negative_update_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            token_prefix: "sgs_".to_string(),
            default_update_interval: Duration::from_secs(24 * 60 * 60),
            min_update_interval: Duration::from_secs(10 * 60),
            negative_update_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Cache-through actor source backed by the subscriptions identity API.
pub struct SubscriptionsSource {
    client: Arc<dyn SubscriptionsClient>,
    cache: Arc<dyn Cache>,
    config: SourceConfig,
}

/// Cache key for a token: versioned so the entry layout can evolve.
fn cache_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("actor:v1:{digest:x}")
}

/// Build a fresh actor from the subscription state the identity service
/// reported for `token`.
pub fn build_actor(token: &str, state: &SubscriptionState) -> Actor {
    let rate_limit = state
        .gateway_access
        .rate_limit
        .map(|spec| RateLimit::new(spec.limit, Duration::from_secs(spec.interval_seconds)))
        .unwrap_or_else(RateLimit::zero);

    Actor {
        key: token.to_string(),
        id: state.id.clone(),
        access_enabled: !state.is_archived && state.gateway_access.enabled && rate_limit.is_valid(),
        rate_limit,
        last_updated: Utc::now(),
        source_name: SOURCE_NAME.to_string(),
    }
}

/// Actor cached after a failed resolution: no identity, no entitlement.
fn negative_actor(token: &str) -> Actor {
    Actor {
        key: token.to_string(),
        id: String::new(),
        access_enabled: false,
        rate_limit: RateLimit::zero(),
        last_updated: Utc::now(),
        source_name: SOURCE_NAME.to_string(),
    }
}

impl SubscriptionsSource {
    pub fn new(
        client: Arc<dyn SubscriptionsClient>,
        cache: Arc<dyn Cache>,
        config: SourceConfig,
    ) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    fn is_stale(&self, actor: &Actor) -> bool {
        let interval = if actor.id.is_empty() {
            self.config.negative_update_interval
        } else {
            self.config.default_update_interval
        };
        actor.age() > interval
    }

    /// Serialize and store an actor; cache write failures only degrade the
    /// next lookup, so they are logged rather than propagated.
    async fn cache_actor(&self, actor: &Actor) {
        let raw = match serde_json::to_vec(actor) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("could not serialize actor for cache: {err}");
                return;
            }
        };
        if let Err(err) = self.cache.set(&cache_key(&actor.key), raw).await {
            tracing::warn!("actor cache write failed: {err:#}");
        }
    }

    /// Validate the token upstream and cache the outcome, negative or not.
    async fn fetch_and_cache(&self, token: &str) -> Result<Actor> {
        match self.client.check_access_token(token).await {
            Ok(state) => {
                let actor = build_actor(token, &state);
                self.cache_actor(&actor).await;
                Ok(actor)
            }
            Err(err) => {
                // Cache the absence of an entitlement so repeated presentations
                // of a bad token do not hammer the identity service, but fail
                // this request.
                self.cache_actor(&negative_actor(token)).await;
                Err(err.context("checking access token"))
            }
        }
    }
}

#[async_trait]
impl ActorSource for SubscriptionsSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn resolve(&self, token: &str) -> Resolution {
        if !token.starts_with(&self.config.token_prefix) {
            return Resolution::NotClaimed;
        }

        let key = cache_key(token);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_slice::<Actor>(&raw) {
                Ok(actor) if !self.is_stale(&actor) => return Resolution::Claimed(actor),
                Ok(_) => {} // stale entry, refetch below
                Err(err) => {
                    // Corrupt payloads are treated as a miss, not an error.
                    tracing::warn!("malformed cached actor, evicting: {err}");
                    if let Err(err) = self.cache.delete(&key).await {
                        tracing::warn!("could not evict corrupt cache entry: {err:#}");
                    }
                }
            },
            Ok(None) => {}
            Err(err) => {
                // Cache outage degrades to an upstream fetch per request.
                tracing::warn!("actor cache read failed: {err:#}");
            }
        }

        match self.fetch_and_cache(token).await {
            Ok(actor) => Resolution::Claimed(actor),
            Err(err) => Resolution::Failed(err),
        }
    }

    async fn update(&self, actor: &Actor) {
        if actor.age() < self.config.min_update_interval {
            return;
        }
        if let Err(err) = self.fetch_and_cache(&actor.key).await {
            tracing::warn!("opportunistic actor refresh failed: {err:#}");
        }
    }
}

#[async_trait]
impl SourceSyncer for SubscriptionsSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn sync(&self) -> Result<usize> {
        let records = self
            .client
            .list_subscriptions()
            .await
            .context("listing subscriptions")?;

        let mut seen = 0usize;
        for record in &records {
            for token in &record.access_tokens {
                let actor = build_actor(token, &record.state);
                let raw = match serde_json::to_vec(&actor) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(subscription = %record.state.id, "skipping token in sync: {err}");
                        continue;
                    }
                };
                // One bad record must not abort the whole sync.
                match self.cache.set(&cache_key(token), raw).await {
                    Ok(()) => seen += 1,
                    Err(err) => {
                        tracing::warn!(subscription = %record.state.id, "sync cache write failed: {err:#}");
                    }
                }
            }
        }

        tracing::debug!(tokens = seen, subscriptions = records.len(), "subscription sync pass done");
        Ok(seen)
    }
}
