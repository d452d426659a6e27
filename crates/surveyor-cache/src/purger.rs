// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use surveyor_types::Item;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    cache::{Backend, CacheInner},
    entry::{epoch_nanos, time_from_nanos},
};

/// Sleep used when the cache is empty. Practically infinite; a write with
/// an expiry advances the timer through the expiry hint.
const IDLE_SLEEP: Duration = Duration::from_secs(3_600_000);

/// Resets the hint to "none" so the next earlier write can advance the
/// timer again. Value-checked: if a writer lowered the hint between the
/// purger's read and this reset, the reset backs off and the new value is
/// consumed on the next wake-up.
fn consume_hint(sender: &tokio::sync::watch::Sender<u64>, hinted: u64) {
    sender.send_if_modified(|current| {
        if *current == hinted {
            *current = u64::MAX;
            true
        } else {
            false
        }
    });
}

// Handle to stop the purger loop.
pub(crate) struct PurgerHandle {
    task: JoinHandle<()>,
    tx_shutdown: oneshot::Sender<()>,
}

impl PurgerHandle {
    pub(crate) async fn stop(self) {
        let _ = self.tx_shutdown.send(());
        if let Err(err) = self.task.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }
}

/// Background task that removes expired entries.
///
/// The timer fires either when the scheduled instant arrives, or when a
/// write with an earlier expiry advances it. After each purge the next
/// wake-up is `max(stats.next_expiry, now + min_wait_time)`, so a burst of
/// entries expiring in quick succession cannot busy-spin the loop.
pub(crate) struct Purger;

impl Purger {
    pub(crate) fn start<I, B>(inner: Arc<CacheInner<I, B>>) -> PurgerHandle
    where
        I: Item,
        B: Backend<I>,
    {
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let task = tokio::spawn(Self::run(inner, rx_shutdown));
        PurgerHandle { task, tx_shutdown }
    }

    async fn run<I, B>(inner: Arc<CacheInner<I, B>>, mut rx_shutdown: oneshot::Receiver<()>)
    where
        I: Item,
        B: Backend<I>,
    {
        let mut hint = inner.expiry_hint.subscribe();
        // Entries written before the purger started still count.
        let mut next_purge = None;
        let hinted = *hint.borrow_and_update();
        if hinted != u64::MAX {
            next_purge = Some(hinted);
            consume_hint(&inner.expiry_hint, hinted);
        }

        loop {
            let sleep_for = match next_purge {
                Some(nanos) => time_from_nanos(nanos)
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
                None => IDLE_SLEEP,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    let now = SystemTime::now();
                    match inner.purge_with_metrics(now) {
                        Ok(stats) => {
                            let floor = epoch_nanos(now + inner.parameters.min_wait_time);
                            next_purge = stats
                                .next_expiry
                                .map(|expiry| epoch_nanos(expiry).max(floor));
                        }
                        Err(err) => {
                            warn!("scheduled purge failed: {err}");
                            next_purge = Some(epoch_nanos(now + inner.parameters.min_wait_time));
                        }
                    }
                }
                changed = hint.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let hinted = *hint.borrow_and_update();
                    if hinted != u64::MAX {
                        // A write landed an expiry earlier than the schedule.
                        next_purge = Some(match next_purge {
                            Some(current) => current.min(hinted),
                            None => hinted,
                        });
                        consume_hint(&inner.expiry_hint, hinted);
                    }
                }
                _ = &mut rx_shutdown => {
                    debug!("purger shutting down");
                    return;
                }
            }
        }
    }
}
