//! Fan-out of formatted log lines to streaming subscribers.

use chrono::{SecondsFormat, Utc};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Per-subscriber backlog. Receivers that fall behind lose the oldest lines.
pub const DEFAULT_LOG_QUEUE_DEPTH: usize = 100;

/// Broadcasts formatted log lines to every connected log-stream client.
///
/// Cheap to clone; all clones share one channel. Sending never blocks: with
/// no subscribers the line is dropped, and a slow subscriber only loses its
/// own backlog.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<String>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, line: String) {
        let _ = self.tx.send(line);
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_QUEUE_DEPTH)
    }
}

/// Tracing layer that renders events as `<ISO-ts> - <LEVEL> - <message>`
/// lines into a [`LogBroadcaster`].
pub struct BroadcastLayer {
    broadcaster: LogBroadcaster,
}

impl BroadcastLayer {
    pub fn new(broadcaster: LogBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{} - {} - {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level(),
            visitor.message
        );
        self.broadcaster.broadcast(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn layer_formats_and_broadcasts_lines() {
        let broadcaster = LogBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        let subscriber =
            tracing_subscriber::registry().with(BroadcastLayer::new(broadcaster.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("job started");
        });

        let line = rx.try_recv().unwrap();
        assert!(line.contains(" - INFO - job started"), "line: {line}");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_publisher() {
        let broadcaster = LogBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.broadcast(format!("line {i}"));
        }

        // The receiver lagged; the channel reports how much was lost and
        // resumes at the oldest retained line.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(lost)) => assert_eq!(lost, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap(), "line 3");
        assert_eq!(rx.try_recv().unwrap(), "line 4");
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let broadcaster = LogBroadcaster::new(2);
        broadcaster.broadcast("nobody listening".to_string());
    }
}
