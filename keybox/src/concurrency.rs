use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

/// Deduplication of concurrent `get_or_set` misses for the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SingleFlight {
    /// Every caller that misses runs its own factory.
    #[default]
    Disabled,
    /// One caller runs the factory; concurrent callers for the same key wait
    /// for it and then read the cached value.
    Enabled,
}

/// Result of joining a flight - whether to run the factory or await another caller.
pub(crate) enum Flight<'a> {
    /// Run the factory. Waiters are released when the guard drops.
    Leader(FlightGuard<'a>),
    /// Wait for the leader, then re-read.
    Follower(broadcast::Receiver<()>),
}

/// In-flight factories keyed by full cache key.
#[derive(Debug, Default)]
pub(crate) struct FlightGroup {
    flights: DashMap<String, broadcast::Sender<()>>,
}

impl FlightGroup {
    pub(crate) fn join(&self, key: &str) -> Flight<'_> {
        match self.flights.entry(key.to_owned()) {
            Entry::Occupied(flight) => Flight::Follower(flight.get().subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(1);
                slot.insert(sender);
                Flight::Leader(FlightGuard {
                    group: self,
                    key: key.to_owned(),
                })
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Releases waiters on drop, whether the leader finished, failed or was cancelled.
pub(crate) struct FlightGuard<'a> {
    group: &'a FlightGroup,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, sender)) = self.group.flights.remove(&self.key) {
            // No receivers is fine.
            let _ = sender.send(());
        }
    }
}

/// Waits until the leader of a flight is done.
pub(crate) async fn wait(mut receiver: broadcast::Receiver<()>) {
    // A closed channel also means the leader is gone.
    let _ = receiver.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_follows_the_first() {
        let group = FlightGroup::default();
        let leader = match group.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };
        let receiver = match group.join("k") {
            Flight::Follower(receiver) => receiver,
            Flight::Leader(_) => panic!("second caller must follow"),
        };
        assert_eq!(group.in_flight(), 1);

        let waiter = tokio::spawn(wait(receiver));
        drop(leader);
        waiter.await.unwrap();
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn keys_fly_independently() {
        let group = FlightGroup::default();
        let first = group.join("a");
        let second = group.join("b");
        assert!(matches!(first, Flight::Leader(_)));
        assert!(matches!(second, Flight::Leader(_)));
    }
}
