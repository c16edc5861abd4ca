//! Passes through values matching a predicate. Stateless.

use std::sync::Arc;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{OperatorError, PredicateFn};
use crate::pipeline::SubscribeContext;
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The filter (where) sequence definition.
pub struct Filter<T> {
    source: SubscribableRef<T>,
    predicate: PredicateFn<T>,
}

impl<T: Send + 'static> Filter<T> {
    /// Creates a filter over `source`.
    pub fn new(source: SubscribableRef<T>, predicate: PredicateFn<T>) -> Self {
        Self { source, predicate }
    }
}

impl<T: Send + 'static> Subscribable<T> for Filter<T> {
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(FilterOp {
            base: OperatorBase::new("rill/filter", 1, ctx.operator_context().clone()),
            output,
            predicate: Arc::clone(&self.predicate),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct FilterOp<T> {
    base: OperatorBase,
    output: ObserverRef<T>,
    predicate: PredicateFn<T>,
    upstream: SingleAssignmentSubscription,
}

impl<T> FilterOp<T> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<T: Send + 'static> Observer<T> for FilterOp<T> {
    fn on_next(&self, value: T) {
        if self.base.is_disposed() {
            return;
        }
        match (self.predicate)(&value) {
            Ok(true) => self.output.on_next(value),
            Ok(false) => {}
            Err(error) => {
                self.output.on_error(error);
                self.terminate();
            }
        }
    }

    fn on_error(&self, error: OperatorError) {
        if self.base.is_disposed() {
            return;
        }
        self.output.on_error(error);
        self.terminate();
    }

    fn on_completed(&self) {
        if self.base.is_disposed() {
            return;
        }
        self.output.on_completed();
        self.terminate();
    }
}

impl<T: Send + 'static> OperatorNode for FilterOp<T> {
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn dispose(&self) {
        self.terminate();
    }

    fn is_disposed(&self) -> bool {
        self.base.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    #[test]
    fn test_filter_drops_non_matching() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let filter = Filter::new(
            source.clone() as SubscribableRef<i32>,
            Arc::new(|v: &i32| Ok(v % 2 == 0)),
        );
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(&filter, observer.clone(), context);
        pipeline.start().unwrap();

        source.push_all([1, 2, 3, 4, 5, 6]);
        source.complete();

        assert_eq!(observer.values(), vec![2, 4, 6]);
        assert!(observer.is_completed());
    }
}
