// Background sync worker - proactively refreshes actor caches.
//
// One dedicated periodic task, independent of the request path. Each tick
// runs every registered syncer concurrently (one task per source); errors
// are collected per source so one failing backend never cancels the others.
// `stop` only flips the running flag: future ticks are halted, in-flight
// syncs are left to finish on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::Sources;

pub struct SyncWorker {
    sources: Arc<Sources>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn new(sources: Arc<Sources>, interval: Duration) -> Self {
        Self {
            sources,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin ticking. The first sync pass runs immediately.
    pub fn start(&self) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let sources = self.sources.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    tracing::debug!("sync worker stopped");
                    break;
                }
                run_sync_pass(&sources).await;
            }
        })
    }

    /// Halt future ticks. Returns immediately; an in-flight pass finishes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Run one sync across every syncer concurrently, isolating failures.
async fn run_sync_pass(sources: &Sources) {
    let mut tasks = JoinSet::new();
    for syncer in sources.syncers() {
        let syncer = syncer.clone();
        tasks.spawn(async move { (syncer.name(), syncer.sync().await) });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(seen))) => {
                tracing::info!(source = name, tokens = seen, "source sync complete");
            }
            Ok((name, Err(err))) => {
                tracing::warn!(source = name, "source sync failed: {err:#}");
            }
            Err(err) => {
                tracing::warn!("sync task panicked: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorSource, Resolution, SourceSyncer};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingSyncer {
        name: &'static str,
        syncs: AtomicUsize,
        fail: bool,
    }

    impl CountingSyncer {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                syncs: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ActorSource for CountingSyncer {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn resolve(&self, _token: &str) -> Resolution {
            Resolution::NotClaimed
        }
        async fn update(&self, _actor: &Actor) {}
    }

    #[async_trait]
    impl SourceSyncer for CountingSyncer {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn sync(&self) -> anyhow::Result<usize> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("backend unavailable"))
            } else {
                Ok(1)
            }
        }
    }

    #[tokio::test]
    async fn one_failing_source_does_not_cancel_the_others() {
        let healthy = CountingSyncer::new("healthy", false);
        let broken = CountingSyncer::new("broken", true);

        let mut sources = Sources::new();
        sources.add_synced(healthy.clone());
        sources.add_synced(broken.clone());

        run_sync_pass(&sources).await;

        assert_eq!(healthy.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(broken.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_ticks_and_stop_halts_future_ticks() {
        let syncer = CountingSyncer::new("only", false);
        let mut sources = Sources::new();
        sources.add_synced(syncer.clone());

        let worker = SyncWorker::new(Arc::new(sources), Duration::from_millis(10));
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(45)).await;
        worker.stop();
        let after_stop = syncer.syncs.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        // No further passes once stopped.
        tokio::time::sleep(Duration::from_millis(45)).await;
        // stop() only flips the flag, so at most one already-ticked pass may
        // have slipped in before the flag was observed.
        assert!(syncer.syncs.load(Ordering::SeqCst) <= after_stop + 1);

        handle.await.unwrap();
    }
}
