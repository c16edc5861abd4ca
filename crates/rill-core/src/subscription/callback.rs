//! Callback-style consumption: subscribe with closures.

use std::sync::Arc;

use crate::context::OperatorContext;
use crate::observer::FnObserver;
use crate::operator::OperatorError;
use crate::pipeline::Pipeline;
use crate::subscribable::Subscribable;

/// Subscribes closures to `source` and starts the pipeline.
///
/// The value callback is required; fault and completion callbacks are
/// optional no-ops unless provided through the richer
/// [`FnObserver`] + [`Pipeline::subscribe`] path. The returned pipeline
/// owns the subscription: dropping it cancels.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = subscribe_fn(&chain, context, |value| {
///     println!("got {value}");
/// });
/// ```
pub fn subscribe_fn<T: Send + 'static>(
    source: &dyn Subscribable<T>,
    context: OperatorContext,
    on_next: impl Fn(T) + Send + Sync + 'static,
) -> Pipeline {
    let observer = Arc::new(FnObserver::new(on_next));
    let pipeline = Pipeline::subscribe(source, observer, context);
    // Subscribing through this surface is always a fresh computation;
    // recovery goes through Pipeline::restore before start instead.
    pipeline
        .start()
        .expect("freshly subscribed pipeline cannot be disposed");
    pipeline
}

/// Subscribes closures for all three notification kinds and starts the
/// pipeline.
pub fn subscribe_callback<T: Send + 'static>(
    source: &dyn Subscribable<T>,
    context: OperatorContext,
    on_next: impl Fn(T) + Send + Sync + 'static,
    on_error: impl Fn(OperatorError) + Send + Sync + 'static,
    on_completed: impl Fn() + Send + Sync + 'static,
) -> Pipeline {
    let observer = Arc::new(
        FnObserver::new(on_next)
            .with_error(on_error)
            .with_completed(on_completed),
    );
    let pipeline = Pipeline::subscribe(source, observer, context);
    pipeline
        .start()
        .expect("freshly subscribed pipeline cannot be disposed");
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, PushSource};
    use parking_lot::Mutex;

    #[test]
    fn test_subscribe_fn_delivers_values() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let _pipeline = subscribe_fn(source.as_ref(), context, move |v| {
            sink.lock().push(v);
        });

        source.push_all([1, 2, 3]);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_subscribe_callback_observes_completion() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&done);

        let _pipeline = subscribe_callback(
            source.as_ref(),
            context,
            |_| {},
            |_| {},
            move || flag.store(true, std::sync::atomic::Ordering::SeqCst),
        );

        source.complete();
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }
}
