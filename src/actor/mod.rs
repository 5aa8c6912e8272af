// Actor model - resolved caller identity, entitlement, and rate-limit value.
//
// An `Actor` is produced by an `ActorSource` from a bearer token and attached
// to the request for downstream handlers. Actors are immutable once built:
// a refresh always produces a new value that replaces the cached one, so
// concurrent readers never observe in-place mutation.

pub mod cache;
pub mod subscriptions;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Permitted request volume per interval. Carried on the actor for the
/// enforcement layer; the gateway itself only computes the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: i64,
    pub interval: Duration,
}

impl RateLimit {
    pub fn new(limit: i64, interval: Duration) -> Self {
        Self { limit, interval }
    }

    /// A rate limit that grants nothing; used for negative actors.
    pub fn zero() -> Self {
        Self {
            limit: 0,
            interval: Duration::ZERO,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.limit > 0 && !self.interval.is_zero()
    }
}

/// Resolved identity attached to an authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// The bearer token this actor was looked up by (also the cache identity).
    pub key: String,
    /// Stable identifier from the upstream identity system. Empty for
    /// negative actors cached after a failed resolution.
    pub id: String,
    /// Computed at resolution time: subscription not archived, feature flag
    /// enabled, and a well-formed rate limit.
    pub access_enabled: bool,
    pub rate_limit: RateLimit,
    /// When this actor was last resolved; drives the staleness policy.
    pub last_updated: DateTime<Utc>,
    /// Name of the source that produced this actor. Attribution only,
    /// never identity.
    pub source_name: String,
}

impl Actor {
    /// Time since the last successful resolution.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.last_updated)
            .to_std()
            .unwrap_or_default()
    }
}

/// Outcome of asking one source about a token.
///
/// Modeled as a tagged variant rather than a sentinel error so the
/// aggregator's branching is explicit and exhaustive: `NotClaimed` is pure
/// control flow (try the next source), `Failed` is a hard resolution failure
/// that terminates the lookup.
pub enum Resolution {
    Claimed(Actor),
    NotClaimed,
    Failed(anyhow::Error),
}

/// No configured source recognized the token's format.
#[derive(Debug, thiserror::Error)]
#[error("no source found for token")]
pub struct NoSourceError;

/// A backend capable of resolving bearer tokens to actors.
#[async_trait]
pub trait ActorSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve a token. Must return `NotClaimed` quickly for tokens that do
    /// not match this source's format.
    async fn resolve(&self, token: &str) -> Resolution;

    /// Opportunistic refresh for callers that already hold an actor.
    /// Best-effort: debounced internally, errors logged and swallowed.
    async fn update(&self, actor: &Actor);
}

/// A source that can bulk-refresh its cache from upstream.
#[async_trait]
pub trait SourceSyncer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Proactively seed/refresh cache entries for every known token.
    /// Returns the number of tokens successfully processed.
    async fn sync(&self) -> Result<usize>;
}

/// Ordered collection of actor sources, tried highest priority first.
#[derive(Default)]
pub struct Sources {
    sources: Vec<Arc<dyn ActorSource>>,
    syncers: Vec<Arc<dyn SourceSyncer>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source that cannot bulk-sync.
    pub fn add(&mut self, source: Arc<dyn ActorSource>) {
        self.sources.push(source);
    }

    /// Register a source that also supports background sync.
    pub fn add_synced<S>(&mut self, source: Arc<S>)
    where
        S: ActorSource + SourceSyncer + 'static,
    {
        self.sources.push(source.clone());
        self.syncers.push(source);
    }

    pub fn syncers(&self) -> &[Arc<dyn SourceSyncer>] {
        &self.syncers
    }

    /// Resolve a token against the configured sources in priority order.
    ///
    /// The first source that claims the token decides the outcome; later
    /// sources are never consulted once a token is claimed or fails hard.
    pub async fn get(&self, token: &str) -> Result<Actor> {
        for source in &self.sources {
            match source.resolve(token).await {
                Resolution::Claimed(actor) => return Ok(actor),
                Resolution::NotClaimed => continue,
                Resolution::Failed(err) => {
                    return Err(err.context(format!("resolving actor via {}", source.name())))
                }
            }
        }
        Err(anyhow!(NoSourceError))
    }

    /// Route an opportunistic refresh to the source that produced the actor.
    pub async fn update(&self, actor: &Actor) {
        for source in &self.sources {
            if source.name() == actor.source_name {
                source.update(actor).await;
                return;
            }
        }
        tracing::warn!(
            "no source named {:?} registered for actor update",
            actor.source_name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn actor(source_name: &str, id: &str) -> Actor {
        Actor {
            key: "sgs_test".to_string(),
            id: id.to_string(),
            access_enabled: true,
            rate_limit: RateLimit::new(60, Duration::from_secs(3600)),
            last_updated: Utc::now(),
            source_name: source_name.to_string(),
        }
    }

    /// Source scripted to return a fixed resolution, counting calls.
    struct ScriptedSource {
        name: &'static str,
        outcome: fn(&'static str) -> Resolution,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(name: &'static str, outcome: fn(&'static str) -> Resolution) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ActorSource for ScriptedSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _token: &str) -> Resolution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(self.name)
        }

        async fn update(&self, _actor: &Actor) {}
    }

    #[tokio::test]
    async fn aggregator_falls_through_unclaimed_sources() {
        let first = ScriptedSource::new("first", |_| Resolution::NotClaimed);
        let second = ScriptedSource::new("second", |name| Resolution::Claimed(actor(name, "a-2")));
        let third = ScriptedSource::new("third", |name| Resolution::Claimed(actor(name, "a-3")));

        let mut sources = Sources::new();
        sources.add(first.clone());
        sources.add(second.clone());
        sources.add(third.clone());

        let resolved = sources.get("sgs_test").await.unwrap();
        assert_eq!(resolved.id, "a-2");
        assert_eq!(resolved.source_name, "second");

        // The claiming source terminates iteration; later sources untouched.
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hard_failure_stops_iteration_and_names_the_source() {
        let failing =
            ScriptedSource::new("broken", |_| Resolution::Failed(anyhow!("upstream down")));
        let next = ScriptedSource::new("next", |name| Resolution::Claimed(actor(name, "a")));

        let mut sources = Sources::new();
        sources.add(failing);
        sources.add(next.clone());

        let err = sources.get("sgs_test").await.unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert_eq!(next.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unclaimed_token_yields_no_source_error() {
        let only = ScriptedSource::new("only", |_| Resolution::NotClaimed);
        let mut sources = Sources::new();
        sources.add(only);

        let err = sources.get("zzz_other").await.unwrap_err();
        assert!(err.downcast_ref::<NoSourceError>().is_some());
    }

    #[test]
    fn rate_limit_validity() {
        assert!(RateLimit::new(60, Duration::from_secs(3600)).is_valid());
        assert!(!RateLimit::new(0, Duration::from_secs(3600)).is_valid());
        assert!(!RateLimit::new(60, Duration::ZERO).is_valid());
        assert!(!RateLimit::zero().is_valid());
        assert!(!RateLimit::new(-1, Duration::from_secs(1)).is_valid());
    }
}
