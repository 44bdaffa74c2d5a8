/*!
 # Cooperative scheduler loop

 One periodic task drives the whole system: every tick it evaluates the
 schedule of every channel, then pushes at most one coalesced bitmask to
 the device link. Device errors never stop the loop; the target state is
 simply re-asserted on a later tick.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::device::RelayLink;
use crate::registry::ChannelRegistry;
use crate::schedule::TimeOfDay;

/// Interval between schedule evaluations. Minute granularity is the
/// contract; the half-open window semantics tolerate a late tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The wall clock, reduced to the minute granularity the evaluator uses.
pub fn local_time_of_day() -> TimeOfDay {
    let now = Local::now();
    TimeOfDay::new(now.hour() as u8, now.minute() as u8)
}

/// Periodic driver connecting the registry to the device link.
pub struct Scheduler {
    registry: Arc<RwLock<ChannelRegistry>>,
    link: Arc<RelayLink>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(registry: Arc<RwLock<ChannelRegistry>>, link: Arc<RelayLink>) -> Self {
        Scheduler {
            registry,
            link,
            interval: TICK_INTERVAL,
        }
    }

    /// Overrides the tick interval, mainly for demos and tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    ///
    /// Closing the device link is the guaranteed release step on the way
    /// out, whatever state the session is in.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "scheduler started");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(local_time_of_day()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
        self.link.close();
    }

    /// One evaluation pass. Every channel is evaluated before the single
    /// coalesced device write; a no-op pass skips the write entirely.
    pub async fn tick(&self, now: TimeOfDay) {
        let outcome = self.registry.write().apply_schedule_tick(now);
        if !outcome.changed {
            return;
        }
        debug!(
            now = %now,
            mask = format_args!("{:#010b}", outcome.mask),
            "tick changed channel states"
        );
        if let Err(err) = self.link.send_mask(outcome.mask).await {
            warn!(%err, "device write failed, will retry on a later tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsbId;
    use crate::schedule::{Phase, Schedule};

    fn simulated_link() -> Arc<RelayLink> {
        let link = RelayLink::new(UsbId::Unset, UsbId::Unset);
        link.discover();
        Arc::new(link)
    }

    fn window(start: (u8, u8), end: (u8, u8)) -> Schedule {
        Schedule {
            start: TimeOfDay::new(start.0, start.1),
            end: TimeOfDay::new(end.0, end.1),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn tick_pushes_one_coalesced_mask() {
        let mut registry = ChannelRegistry::new(8);
        registry.set_schedule(1, window((8, 0), (9, 0))).unwrap();
        registry.set_schedule(4, window((7, 30), (8, 30))).unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let link = simulated_link();
        let scheduler = Scheduler::new(registry.clone(), link.clone());

        // Both windows contain 08:00; the link sees their union at once.
        scheduler.tick(TimeOfDay::new(8, 0)).await;
        assert_eq!(link.session().last_known_mask, 0b0000_1001);
        assert_eq!(registry.read().get(1).unwrap().phase, Phase::Active);
        assert_eq!(registry.read().get(4).unwrap().phase, Phase::Active);
    }

    #[tokio::test]
    async fn quiet_tick_writes_nothing() {
        let registry = Arc::new(RwLock::new(ChannelRegistry::new(8)));
        let link = simulated_link();
        link.send_mask(0b0000_0010).await.unwrap();
        let scheduler = Scheduler::new(registry, link.clone());

        // No schedules, no state change: the confirmed mask stays as-is.
        scheduler.tick(TimeOfDay::new(12, 0)).await;
        assert_eq!(link.session().last_known_mask, 0b0000_0010);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_closes_link() {
        let registry = Arc::new(RwLock::new(ChannelRegistry::new(8)));
        let link = simulated_link();
        let scheduler = Scheduler::new(registry, link.clone())
            .with_interval(Duration::from_millis(10));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(stop_rx));
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(
            link.session().connection,
            crate::device::Connection::Closed
        );
    }
}
