//! Projects each upstream value through a selector.
//!
//! The selector is the only user code on the path; a failure it reports
//! becomes the single terminal error and the operator tears down its
//! upstream subscription. Stateless: nothing is persisted.

use std::sync::Arc;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{OperatorError, SelectorFn};
use crate::pipeline::SubscribeContext;
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The map (select) sequence definition.
pub struct Map<T, R> {
    source: SubscribableRef<T>,
    selector: SelectorFn<T, R>,
}

impl<T: Send + 'static, R: Send + 'static> Map<T, R> {
    /// Creates a map over `source`.
    pub fn new(source: SubscribableRef<T>, selector: SelectorFn<T, R>) -> Self {
        Self { source, selector }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscribable<R> for Map<T, R> {
    fn subscribe(&self, output: ObserverRef<R>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(MapOp {
            base: OperatorBase::new("rill/map", 1, ctx.operator_context().clone()),
            output,
            selector: Arc::clone(&self.selector),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct MapOp<T, R> {
    base: OperatorBase,
    output: ObserverRef<R>,
    selector: SelectorFn<T, R>,
    upstream: SingleAssignmentSubscription,
}

impl<T, R> MapOp<T, R> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Observer<T> for MapOp<T, R> {
    fn on_next(&self, value: T) {
        if self.base.is_disposed() {
            return;
        }
        match (self.selector)(&value) {
            Ok(mapped) => self.output.on_next(mapped),
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

impl<T: Send + 'static, R: Send + 'static> OperatorNode for MapOp<T, R> {
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
    fn test_map_projects_values() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let map = Map::new(
            source.clone() as SubscribableRef<i32>,
            Arc::new(|v: &i32| Ok(v * 10)),
        );
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(&map, observer.clone(), context);
        pipeline.start().unwrap();

        source.push_all([1, 2, 3]);
        source.complete();

        assert_eq!(observer.values(), vec![10, 20, 30]);
        assert!(observer.is_completed());
    }

    #[test]
    fn test_map_selector_failure_is_terminal() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let map = Map::new(
            source.clone() as SubscribableRef<i32>,
            Arc::new(|v: &i32| {
                if *v < 0 {
                    Err(OperatorError::user("negative input"))
                } else {
                    Ok(*v)
                }
            }),
        );
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(&map, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(1);
        source.push(-1);
        source.push(2);

        assert_eq!(observer.values(), vec![1]);
        assert!(matches!(
            observer.error(),
            Some(OperatorError::UserFunction { .. })
        ));
        assert_eq!(observer.terminal_count(), 1);
        // Upstream observer was released on the fault.
        assert_eq!(source.observer_count(), 0);
    }
}
