//! The flush actor: periodic write-back of dirty cache entries and
//! capacity eviction.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::cache::VaultCache;
use crate::config::Config;
use crate::keys::OwnerId;
use crate::metrics::Metrics;
use crate::store::VaultStore;

/// Messages to the flush actor.
#[derive(derive_more::Debug, strum::Display)]
pub(super) enum ToFlushActor {
    /// Persist one owner's pending mutations now, bypassing the cycle.
    ForceSave {
        owner: OwnerId,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

pub(super) struct FlushActor<S: VaultStore> {
    inbox: mpsc::Receiver<ToFlushActor>,
    cache: VaultCache<S>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl<S: VaultStore> FlushActor<S> {
    pub(super) fn new(
        inbox: mpsc::Receiver<ToFlushActor>,
        cache: VaultCache<S>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inbox,
            cache,
            config,
            metrics,
        }
    }

    /// Run the actor loop until shutdown or until the engine is dropped.
    pub(super) async fn run(mut self) {
        // first cycle one interval in; there is nothing to flush at startup
        let mut flush = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_reply = loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break None };
                    trace!(%msg, "tick: inbox");
                    match msg {
                        ToFlushActor::ForceSave { owner, reply } => {
                            let res = self.cache.flush_owner(&owner).await;
                            reply.send(res).ok();
                        }
                        ToFlushActor::Shutdown { reply } => break Some(reply),
                    }
                }
                _ = flush.tick() => {
                    self.metrics.flush_ticks.inc();
                    let flushed = self.cache.flush_dirty().await;
                    if flushed > 0 {
                        trace!(flushed, "flush cycle");
                    }
                    self.cache.evict_if_over_capacity();
                }
            }
        };

        // final write-back so shutdown never strands dirty entries
        let flushed = self.cache.flush_dirty().await;
        if flushed > 0 {
            debug!(flushed, "flushed remaining entries on shutdown");
        }
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
        debug!("flush actor stopped");
    }
}
