//! Fluent combinators over [`SubscribableRef`].
//!
//! Thin sugar: every method builds the corresponding operator definition
//! and erases it back to a [`SubscribableRef`], so chains read top-down:
//!
//! ```rust,ignore
//! let totals = prices
//!     .filter(|p: &i64| Ok(*p > 0))
//!     .map(|p: &i64| Ok(p * 100))
//!     .buffer_count(10);
//! ```

use std::hash::Hash;
use std::sync::Arc;

use crate::operator::aggregate;
use crate::operator::buffer::{BufferCount, BufferFerry, BufferTime};
use crate::operator::combine_latest::CombineLatest2;
use crate::operator::distinct::DistinctUntilChanged;
use crate::operator::filter::Filter;
use crate::operator::group_by::{GroupBy, GroupedStream};
use crate::operator::map::Map;
use crate::operator::numeric::{self, Numeric};
use crate::operator::scan::Scan;
use crate::operator::select_many::SelectMany;
use crate::operator::sequence_equal::SequenceEqual;
use crate::operator::skip_until::SkipUntil;
use crate::operator::switch::Switch;
use crate::operator::take::Take;
use crate::operator::throttle::Throttle;
use crate::operator::window::{WindowCount, WindowFerry, WindowTime};
use crate::operator::OperatorError;
use crate::state::StateValue;
use crate::subscribable::SubscribableRef;
use crate::tunnel::TunnelRef;

/// Fluent combinators for composing operator pipelines.
pub trait SubscribableExt<T: Send + 'static> {
    /// Projects each value through `selector`.
    fn map<R: Send + 'static>(
        &self,
        selector: impl Fn(&T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>;

    /// Keeps values matching `predicate`.
    fn filter(
        &self,
        predicate: impl Fn(&T) -> Result<bool, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T>;

    /// Forwards the first `count` values, then completes.
    fn take(&self, count: u64) -> SubscribableRef<T>;

    /// Emits the running fold after every value.
    fn scan<R>(
        &self,
        seed: R,
        fold: impl Fn(&R, &T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + Sync + StateValue + 'static;

    /// Suppresses consecutive duplicates.
    fn distinct_until_changed(&self) -> SubscribableRef<T>
    where
        T: Clone + PartialEq + StateValue;

    /// Folds from `seed`, emitting the final accumulator at completion.
    fn aggregate<R>(
        &self,
        seed: R,
        fold: impl Fn(&R, &T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + Sync + StateValue + 'static;

    /// Folds without a seed; errors on an empty source.
    fn reduce(
        &self,
        fold: impl Fn(&T, &T) -> Result<T, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T>
    where
        T: Clone + StateValue;

    /// Sums the sequence (zero when empty).
    fn sum(&self) -> SubscribableRef<T>
    where
        T: Numeric;

    /// Minimum of the sequence (NaN orders below everything).
    fn min(&self) -> SubscribableRef<T>
    where
        T: Numeric;

    /// Maximum of the sequence (NaN orders below everything).
    fn max(&self) -> SubscribableRef<T>
    where
        T: Numeric;

    /// Mean of the sequence as `f64`.
    fn average(&self) -> SubscribableRef<f64>
    where
        T: Numeric;

    /// Compares element-wise against `other`, emitting one boolean.
    fn sequence_equal(&self, other: &SubscribableRef<T>) -> SubscribableRef<bool>
    where
        T: Clone + PartialEq + StateValue;

    /// Combines with `other`, firing on every value once both have one.
    fn combine_latest<U, R>(
        &self,
        other: &SubscribableRef<U>,
        combiner: impl Fn(&T, &U) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        T: Clone + StateValue,
        U: Clone + Send + StateValue + 'static,
        R: Send + 'static;

    /// Drops values until `trigger` fires.
    fn skip_until<U: Send + 'static>(&self, trigger: &SubscribableRef<U>) -> SubscribableRef<T>;

    /// Batches every `count` values.
    fn buffer_count(&self, count: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue;

    /// Batches of `count` values, a new one opening every `skip`.
    fn buffer_count_skip(&self, count: usize, skip: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue;

    /// Batches every `duration` milliseconds.
    fn buffer_time(&self, duration: i64) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue;

    /// Batches of `duration` milliseconds, a new one every `shift`.
    fn buffer_time_shift(&self, duration: i64, shift: i64) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue;

    /// Batches closed by duration or count, whichever first.
    fn buffer_ferry(&self, duration: i64, count: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue;

    /// Windows every `count` values.
    fn window_count(&self, count: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone;

    /// Windows of `count` values, a new one opening every `skip`.
    fn window_count_skip(&self, count: usize, skip: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone;

    /// Windows every `duration` milliseconds.
    fn window_time(&self, duration: i64) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone;

    /// Windows of `duration` milliseconds, a new one every `shift`.
    fn window_time_shift(&self, duration: i64, shift: i64) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone;

    /// Windows closed by duration or count, whichever first.
    fn window_ferry(&self, duration: i64, count: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone;

    /// Partitions into per-key nested streams.
    fn group_by<K>(
        &self,
        key_selector: impl Fn(&T) -> Result<K, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<GroupedStream<K, T>>
    where
        T: Clone,
        K: Clone + Eq + Hash + Send + Sync + StateValue + 'static;

    /// Maps each value to an inner sequence and merges the results.
    fn select_many<R>(
        &self,
        selector: impl Fn(&T) -> Result<SubscribableRef<R>, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + 'static;

    /// Throttles against per-item indicator sequences.
    fn throttle<U>(
        &self,
        selector: impl Fn(&T) -> Result<SubscribableRef<U>, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T>
    where
        T: Clone + StateValue,
        U: Send + 'static;
}

impl<T: Send + 'static> SubscribableExt<T> for SubscribableRef<T> {
    fn map<R: Send + 'static>(
        &self,
        selector: impl Fn(&T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R> {
        Arc::new(Map::new(Arc::clone(self), Arc::new(selector)))
    }

    fn filter(
        &self,
        predicate: impl Fn(&T) -> Result<bool, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T> {
        Arc::new(Filter::new(Arc::clone(self), Arc::new(predicate)))
    }

    fn take(&self, count: u64) -> SubscribableRef<T> {
        Arc::new(Take::new(Arc::clone(self), count))
    }

    fn scan<R>(
        &self,
        seed: R,
        fold: impl Fn(&R, &T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + Sync + StateValue + 'static,
    {
        Arc::new(Scan::new(Arc::clone(self), seed, Arc::new(fold)))
    }

    fn distinct_until_changed(&self) -> SubscribableRef<T>
    where
        T: Clone + PartialEq + StateValue,
    {
        Arc::new(DistinctUntilChanged::new(Arc::clone(self)))
    }

    fn aggregate<R>(
        &self,
        seed: R,
        fold: impl Fn(&R, &T) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + Sync + StateValue + 'static,
    {
        Arc::new(aggregate::aggregate(
            Arc::clone(self),
            seed,
            Arc::new(fold),
        ))
    }

    fn reduce(
        &self,
        fold: impl Fn(&T, &T) -> Result<T, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T>
    where
        T: Clone + StateValue,
    {
        Arc::new(aggregate::reduce(Arc::clone(self), Arc::new(fold)))
    }

    fn sum(&self) -> SubscribableRef<T>
    where
        T: Numeric,
    {
        Arc::new(numeric::sum(Arc::clone(self)))
    }

    fn min(&self) -> SubscribableRef<T>
    where
        T: Numeric,
    {
        Arc::new(numeric::min(Arc::clone(self)))
    }

    fn max(&self) -> SubscribableRef<T>
    where
        T: Numeric,
    {
        Arc::new(numeric::max(Arc::clone(self)))
    }

    fn average(&self) -> SubscribableRef<f64>
    where
        T: Numeric,
    {
        Arc::new(numeric::average(Arc::clone(self)))
    }

    fn sequence_equal(&self, other: &SubscribableRef<T>) -> SubscribableRef<bool>
    where
        T: Clone + PartialEq + StateValue,
    {
        Arc::new(SequenceEqual::with_default_comparer(
            Arc::clone(self),
            Arc::clone(other),
        ))
    }

    fn combine_latest<U, R>(
        &self,
        other: &SubscribableRef<U>,
        combiner: impl Fn(&T, &U) -> Result<R, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        T: Clone + StateValue,
        U: Clone + Send + StateValue + 'static,
        R: Send + 'static,
    {
        Arc::new(CombineLatest2::new(
            Arc::clone(self),
            Arc::clone(other),
            combiner,
        ))
    }

    fn skip_until<U: Send + 'static>(&self, trigger: &SubscribableRef<U>) -> SubscribableRef<T> {
        Arc::new(SkipUntil::new(Arc::clone(self), Arc::clone(trigger)))
    }

    fn buffer_count(&self, count: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue,
    {
        Arc::new(BufferCount::new(Arc::clone(self), count))
    }

    fn buffer_count_skip(&self, count: usize, skip: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue,
    {
        Arc::new(BufferCount::with_skip(Arc::clone(self), count, skip))
    }

    fn buffer_time(&self, duration: i64) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue,
    {
        Arc::new(BufferTime::new(Arc::clone(self), duration))
    }

    fn buffer_time_shift(&self, duration: i64, shift: i64) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue,
    {
        Arc::new(BufferTime::with_shift(Arc::clone(self), duration, shift))
    }

    fn buffer_ferry(&self, duration: i64, count: usize) -> SubscribableRef<Vec<T>>
    where
        T: Clone + StateValue,
    {
        Arc::new(BufferFerry::new(Arc::clone(self), duration, count))
    }

    fn window_count(&self, count: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone,
    {
        Arc::new(WindowCount::new(Arc::clone(self), count))
    }

    fn window_count_skip(&self, count: usize, skip: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone,
    {
        Arc::new(WindowCount::with_skip(Arc::clone(self), count, skip))
    }

    fn window_time(&self, duration: i64) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone,
    {
        Arc::new(WindowTime::new(Arc::clone(self), duration))
    }

    fn window_time_shift(&self, duration: i64, shift: i64) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone,
    {
        Arc::new(WindowTime::with_shift(Arc::clone(self), duration, shift))
    }

    fn window_ferry(&self, duration: i64, count: usize) -> SubscribableRef<TunnelRef<T>>
    where
        T: Clone,
    {
        Arc::new(WindowFerry::new(Arc::clone(self), duration, count))
    }

    fn group_by<K>(
        &self,
        key_selector: impl Fn(&T) -> Result<K, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<GroupedStream<K, T>>
    where
        T: Clone,
        K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
    {
        Arc::new(GroupBy::new(Arc::clone(self), Arc::new(key_selector)))
    }

    fn select_many<R>(
        &self,
        selector: impl Fn(&T) -> Result<SubscribableRef<R>, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<R>
    where
        R: Clone + Send + 'static,
    {
        Arc::new(SelectMany::new(Arc::clone(self), Arc::new(selector)))
    }

    fn throttle<U>(
        &self,
        selector: impl Fn(&T) -> Result<SubscribableRef<U>, OperatorError> + Send + Sync + 'static,
    ) -> SubscribableRef<T>
    where
        T: Clone + StateValue,
        U: Send + 'static,
    {
        Arc::new(Throttle::new(Arc::clone(self), Arc::new(selector)))
    }
}

/// Switches to the latest inner sequence of a higher-order stream.
///
/// Free-standing because the receiver's element type is itself a
/// sequence.
pub fn switch<R: Clone + Send + 'static>(
    source: &SubscribableRef<SubscribableRef<R>>,
) -> SubscribableRef<R> {
    Arc::new(Switch::new(Arc::clone(source)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    #[test]
    fn test_chained_pipeline_end_to_end() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i64>::new();
        let chain = (source.clone() as SubscribableRef<i64>)
            .filter(|v: &i64| Ok(v % 2 == 0))
            .map(|v: &i64| Ok(v * 10))
            .buffer_count(2);
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(chain.as_ref(), observer.clone(), context);
        assert_eq!(pipeline.node_count(), 4);
        pipeline.start().unwrap();

        source.push_all([1, 2, 3, 4, 5, 6]);
        source.complete();

        assert_eq!(observer.values(), vec![vec![20, 40], vec![60]]);
        assert!(observer.is_completed());
    }

    #[test]
    fn test_chain_node_keys_are_stable_across_incarnations() {
        let (_scheduler, context) = test_context();
        let build = |source: &Arc<PushSource<i64>>| {
            (source.clone() as SubscribableRef<i64>)
                .map(|v: &i64| Ok(*v))
                .scan(0i64, |acc: &i64, v: &i64| Ok(acc + v))
        };

        let s1 = PushSource::<i64>::new();
        let c1 = build(&s1);
        let o1 = Arc::new(RecordingObserver::new());
        let p1 = Pipeline::subscribe(c1.as_ref(), o1, context.clone());

        let s2 = PushSource::<i64>::new();
        let c2 = build(&s2);
        let o2 = Arc::new(RecordingObserver::new());
        let p2 = Pipeline::subscribe(c2.as_ref(), o2, context);

        assert_eq!(p1.node_keys(), p2.node_keys());
    }

    #[test]
    fn test_chained_checkpoint_round_trip() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let source = PushSource::<i64>::new();
            let chain =
                (source.clone() as SubscribableRef<i64>).scan(0i64, |a: &i64, v: &i64| Ok(a + v));
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(chain.as_ref(), observer.clone(), context.clone());
            pipeline.start().unwrap();
            source.push_all([1, 2, 3]);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.dispose();
        }

        let source = PushSource::<i64>::new();
        let chain =
            (source.clone() as SubscribableRef<i64>).scan(0i64, |a: &i64, v: &i64| Ok(a + v));
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(chain.as_ref(), observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();
        source.push(4);

        assert_eq!(observer.values(), vec![10]);
    }
}
