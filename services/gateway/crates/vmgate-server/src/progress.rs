//! Single-subscriber event delivery for one in-flight operation.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use vmgate_common::{Event, EventKind};

/// Producer side, owned by the executor.
///
/// [`EventSink::finish`] consumes the sink, so exactly one terminal event can
/// be sent. A sink whose subscriber has gone away drops events silently.
#[derive(Debug)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    /// A connected sink and the stream its events are delivered to.
    #[must_use]
    pub fn channel() -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx: Some(tx) },
            ProgressStream {
                rx,
                finished: false,
            },
        )
    }

    /// A sink with no subscriber, for single-response mode.
    #[must_use]
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: EventKind, payload: impl Into<String>) {
        debug_assert!(!kind.is_terminal(), "terminal events go through finish()");
        self.send(Event::new(kind, payload));
    }

    pub fn finish(self, kind: EventKind, payload: impl Into<String>) {
        debug_assert!(kind.is_terminal(), "finish() needs a terminal event");
        self.send(Event::new(kind, payload));
    }

    /// True once the subscriber has disconnected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(mpsc::UnboundedSender::is_closed)
    }

    fn send(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("subscriber gone; event dropped");
            }
        }
    }
}

/// Consumer side: yields events in emission order and ends right after the
/// terminal event.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<Event>,
    finished: bool,
}

impl Stream for ProgressStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.kind.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_and_stream_ends_after_terminal() {
        let (sink, stream) = EventSink::channel();
        sink.emit(EventKind::Info, "starting");
        sink.emit(EventKind::Progress, "line 1");
        sink.emit(EventKind::Progress, "line 2");
        sink.finish(EventKind::Success, "done");

        let events: Vec<Event> = stream.collect().await;
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Info,
                EventKind::Progress,
                EventKind::Progress,
                EventKind::Success
            ]
        );
        assert_eq!(events[2].payload, "line 2");
    }

    #[tokio::test]
    async fn stream_ends_if_producer_vanishes_without_terminal() {
        let (sink, stream) = EventSink::channel();
        sink.emit(EventKind::Info, "starting");
        drop(sink);
        assert_eq!(stream.count().await, 1);
    }

    #[tokio::test]
    async fn disconnected_subscriber_does_not_disturb_producer() {
        let (sink, stream) = EventSink::channel();
        assert!(!sink.is_closed());
        drop(stream);
        assert!(sink.is_closed());
        sink.emit(EventKind::Progress, "ignored");
        sink.finish(EventKind::Error, "ignored too");
    }

    #[test]
    fn discard_sink_accepts_everything() {
        let sink = EventSink::discard();
        assert!(!sink.is_closed());
        sink.emit(EventKind::Status, "{}");
        sink.finish(EventKind::Success, "ok");
    }
}
