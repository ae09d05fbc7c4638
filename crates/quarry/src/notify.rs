//! Channel-based event notifiers.
//!
//! State-transition events (Connected, Disconnected, Error, Closed,
//! Accepted) are delivered through unbounded channels so a slow consumer
//! can never block the transition itself. Dropped subscribers are pruned
//! on the next emit.

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct Notifier<T: Clone + Send + 'static> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> Notifier<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl<T: Clone + Send + 'static> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_subscribers_see_each_event() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        notifier.emit(7u32);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let notifier = Notifier::new();
        let a = notifier.subscribe();
        let _b = notifier.subscribe();
        drop(a);
        notifier.emit(1u32);
        assert_eq!(notifier.subscriber_count(), 1);
    }
}
