//! Deadline-keyed timers for the sync actor.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// A map of deadline to items, with an async wait for the next expiry.
///
/// There is no removal: rescheduling inserts a new deadline and the
/// caller ignores timers that fire earlier than the authoritative
/// deadline it recorded per item. Futures returned from
/// [`Timers::wait_and_drain`] must be recreated after an insert; the
/// actor loop does this naturally by reentering its `select!`.
#[derive(Debug)]
pub(super) struct Timers<T> {
    map: BTreeMap<Instant, Vec<T>>,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<T> Timers<T> {
    /// Arm a timer for `item` at `deadline`.
    pub(super) fn insert(&mut self, deadline: Instant, item: T) {
        self.map.entry(deadline).or_default().push(item);
    }

    /// Wait for the earliest deadline and drain everything due by then.
    ///
    /// Pending forever while no timer is armed.
    pub(super) async fn wait_and_drain(&mut self) -> Vec<(Instant, T)> {
        let Some(deadline) = self.map.keys().next().copied() else {
            return std::future::pending().await;
        };
        sleep_until(deadline).await;
        let later = self.map.split_off(&(deadline + Duration::from_nanos(1)));
        let expired = std::mem::replace(&mut self.map, later);
        expired
            .into_iter()
            .flat_map(|(at, items)| items.into_iter().map(move |item| (at, item)))
            .collect()
    }
}
