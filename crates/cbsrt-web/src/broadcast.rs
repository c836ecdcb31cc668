//! Fan-out of metrics records to every connected observer.
//!
//! Producers push into a single queue; one task drains it and copies each
//! record into a private mailbox per subscriber. Subscriptions travel
//! through the same queue as records, so a subscriber sees exactly the
//! records published after it joined, in production order. A mailbox whose
//! receiving side is gone is dropped on the next delivery or subscription.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use cbsrt_core::model::DerivedMetrics;

type Record = Arc<DerivedMetrics>;

enum Command {
    Publish(Record),
    Subscribe(mpsc::UnboundedSender<Record>),
}

/// Handle to the fan-out task. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Broadcaster {
    queue: mpsc::UnboundedSender<Command>,
}

/// What an observer receives next.
#[derive(Debug)]
pub(crate) enum Frame {
    Record(Record),
    /// Nothing arrived within the idle interval.
    KeepAlive,
}

pub(crate) struct Subscription {
    mailbox: mpsc::UnboundedReceiver<Record>,
}

impl Broadcaster {
    /// Spawns the fan-out task. It ends once every handle is dropped.
    pub(crate) fn spawn() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(fan_out(rx));
        Self { queue }
    }

    pub(crate) fn publish(&self, record: Record) {
        let _ = self.queue.send(Command::Publish(record));
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let _ = self.queue.send(Command::Subscribe(tx));
        Subscription { mailbox }
    }
}

/// Mailboxes of the current observers.
#[derive(Default)]
struct Subscribers {
    mailboxes: Vec<mpsc::UnboundedSender<Record>>,
}

impl Subscribers {
    /// Adds a mailbox, first dropping any whose observer has gone.
    fn add(&mut self, tx: mpsc::UnboundedSender<Record>) {
        self.mailboxes.retain(|tx| !tx.is_closed());
        self.mailboxes.push(tx);
    }

    /// Delivers `record` to every mailbox; returns how many were dropped.
    fn deliver(&mut self, record: &Record) -> usize {
        let before = self.mailboxes.len();
        self.mailboxes.retain(|tx| tx.send(record.clone()).is_ok());
        before - self.mailboxes.len()
    }

    fn len(&self) -> usize {
        self.mailboxes.len()
    }
}

async fn fan_out(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers = Subscribers::default();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Subscribe(tx) => {
                subscribers.add(tx);
                debug!(observers = subscribers.len(), "observer subscribed");
            }
            Command::Publish(record) => {
                let dropped = subscribers.deliver(&record);
                if dropped > 0 {
                    debug!(
                        dropped,
                        remaining = subscribers.len(),
                        "dropped disconnected observers"
                    );
                }
            }
        }
    }
}

impl Subscription {
    /// Next record, or [`Frame::KeepAlive`] after `idle` without one.
    /// `None` once the broadcaster is gone.
    pub(crate) async fn recv_timeout(&mut self, idle: Duration) -> Option<Frame> {
        match tokio::time::timeout(idle, self.mailbox.recv()).await {
            Ok(Some(record)) => Some(Frame::Record(record)),
            Ok(None) => None,
            Err(_) => Some(Frame::KeepAlive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbsrt_core::config::KEEPALIVE_INTERVAL;

    fn record(t: f64) -> Record {
        Arc::new(DerivedMetrics {
            time_s: t,
            ..Default::default()
        })
    }

    async fn next_time(sub: &mut Subscription) -> f64 {
        match sub.recv_timeout(Duration::from_secs(1)).await {
            Some(Frame::Record(r)) => r.time_s,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_record_in_order() {
        let b = Broadcaster::spawn();
        let mut a = b.subscribe();
        let mut c = b.subscribe();
        for t in [1.0, 1.5, 2.0] {
            b.publish(record(t));
        }
        for sub in [&mut a, &mut c] {
            assert_eq!(next_time(sub).await, 1.0);
            assert_eq!(next_time(sub).await, 1.5);
            assert_eq!(next_time(sub).await, 2.0);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_at_join() {
        let b = Broadcaster::spawn();
        let mut early = b.subscribe();
        b.publish(record(1.0));
        let mut late = b.subscribe();
        b.publish(record(2.0));
        assert_eq!(next_time(&mut early).await, 1.0);
        assert_eq!(next_time(&mut late).await, 2.0);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_does_not_affect_others() {
        let b = Broadcaster::spawn();
        let gone = b.subscribe();
        let mut kept = b.subscribe();
        drop(gone);
        b.publish(record(1.0));
        b.publish(record(2.0));
        assert_eq!(next_time(&mut kept).await, 1.0);
        assert_eq!(next_time(&mut kept).await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_when_idle() {
        let b = Broadcaster::spawn();
        let mut sub = b.subscribe();
        assert!(matches!(
            sub.recv_timeout(KEEPALIVE_INTERVAL).await,
            Some(Frame::KeepAlive)
        ));
        b.publish(record(3.0));
        assert!(matches!(
            sub.recv_timeout(KEEPALIVE_INTERVAL).await,
            Some(Frame::Record(_))
        ));
    }

    #[test]
    fn test_closed_mailboxes_pruned_on_subscribe() {
        let mut subs = Subscribers::default();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            subs.add(tx);
            drop(rx);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        subs.add(tx);
        assert_eq!(subs.len(), 1);

        assert_eq!(subs.deliver(&record(1.0)), 0);
        assert_eq!(rx.try_recv().unwrap().time_s, 1.0);
    }
}
