//! Async consumption: bridge a pipeline into a tokio-native stream.
//!
//! [`subscribe_stream`] wires a channel observer into the pipeline and
//! hands back an [`EventStream`] of [`Notification`]s. The pipeline is
//! returned un-started so callers can restore checkpointed state first;
//! once started, notifications flow through an unbounded channel and can
//! be consumed with `recv().await`, `try_recv`, or as a
//! `tokio_stream::Stream`.

use std::pin::Pin;
use std::task::{Context, Poll};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::OperatorContext;
use crate::observer::{Notification, Observer};
use crate::operator::OperatorError;
use crate::pipeline::Pipeline;
use crate::subscribable::Subscribable;

/// An async stream of notifications from a pipeline.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<Notification<T>>,
}

impl<T> EventStream<T> {
    /// Receives the next notification, or `None` once the pipeline side
    /// has been dropped.
    pub async fn recv(&mut self) -> Option<Notification<T>> {
        self.rx.recv().await
    }

    /// Receives without waiting; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Notification<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T> tokio_stream::Stream for EventStream<T> {
    type Item = Notification<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct ChannelObserver<T> {
    tx: mpsc::UnboundedSender<Notification<T>>,
}

impl<T: Send> Observer<T> for ChannelObserver<T> {
    fn on_next(&self, value: T) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(Notification::Next(value));
    }

    fn on_error(&self, error: OperatorError) {
        let _ = self.tx.send(Notification::Error(error));
    }

    fn on_completed(&self) {
        let _ = self.tx.send(Notification::Completed);
    }
}

/// Subscribes `source` into a channel-backed async stream.
///
/// The pipeline is *not* started: restore state first if recovering,
/// then call [`Pipeline::start`].
pub fn subscribe_stream<T: Send + 'static>(
    source: &dyn Subscribable<T>,
    context: OperatorContext,
) -> (Pipeline, EventStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer = Arc::new(ChannelObserver { tx });
    let pipeline = Pipeline::subscribe(source, observer, context);
    (pipeline, EventStream { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, PushSource};

    #[test]
    fn test_notifications_flow_through_channel() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let (pipeline, mut events) = subscribe_stream(source.as_ref(), context);
        pipeline.start().unwrap();

        source.push(7);
        source.complete();

        assert_eq!(events.try_recv(), Some(Notification::Next(7)));
        assert_eq!(events.try_recv(), Some(Notification::Completed));
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let (pipeline, mut events) = subscribe_stream(source.as_ref(), context);
        pipeline.start().unwrap();

        source.push(1);
        assert_eq!(events.recv().await, Some(Notification::Next(1)));
    }
}
