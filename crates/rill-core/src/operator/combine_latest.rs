//! N-ary combine-latest join over 2..=16 independently typed sources.
//!
//! ## Join state
//!
//! One `u32` bitmask tracks the whole join: bit `i` records "source `i`
//! has produced a value", bit `16 + i` records "source `i` has
//! completed". A combined result is produced if and only if every
//! has-value bit is set; the combiner then runs over the latest value of
//! every source.
//!
//! ## Completion
//!
//! A source completing sets its done bit. The join completes when every
//! source has completed, or as soon as any source completes while the
//! join has never assembled a full value set (no combination is possible
//! anymore). A source erroring errors the join and tears down every
//! child.
//!
//! ## Concurrency
//!
//! All child observers of one join share the parent's single lock; mask
//! mutation, latest-value updates, and downstream emission all happen
//! under it, serializing concurrent deliveries from independent sources.
//! Children hold an `Arc` to the parent for upcalls only; the parent
//! owns the child subscriptions and drops them on terminal.
//!
//! ## Persistence
//!
//! The mask, the terminated flag, and each latest slot (as `Option`) are
//! persisted in index order.
//!
//! The typed arities are generated by a macro — the hand-written
//! equivalent of the arity fan-out the fluent surface needs — all
//! sharing the untyped [`JoinMask`] core and one generic child observer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{CompositeSubscription, Subscription, SubscriptionRef};

/// Largest supported join arity.
pub const MAX_ARITY: usize = 16;

/// The fixed-width join tracker: low bits = has-value, high bits =
/// has-completed, for up to [`MAX_ARITY`] sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinMask {
    bits: u32,
    arity: u8,
}

impl JoinMask {
    /// Creates a mask for `arity` sources.
    ///
    /// # Panics
    ///
    /// Panics if `arity` is outside 2..=16; the typed constructors make
    /// this unreachable.
    #[must_use]
    pub fn new(arity: usize) -> Self {
        assert!(
            (2..=MAX_ARITY).contains(&arity),
            "join arity must be between 2 and 16"
        );
        Self {
            bits: 0,
            #[allow(clippy::cast_possible_truncation)]
            arity: arity as u8,
        }
    }

    /// Rebuilds a mask from persisted bits.
    #[must_use]
    pub fn restore(arity: usize, bits: u32) -> Self {
        let mut mask = Self::new(arity);
        mask.bits = bits;
        mask
    }

    fn value_bits(self) -> u32 {
        (1u32 << self.arity) - 1
    }

    /// Records a value received at `index`.
    pub fn set_value(&mut self, index: usize) {
        self.bits |= 1 << index;
    }

    /// Records completion of the source at `index`.
    pub fn set_done(&mut self, index: usize) {
        self.bits |= 1 << (MAX_ARITY + index);
    }

    /// Returns `true` once every source has produced a value.
    #[must_use]
    pub fn all_values(self) -> bool {
        self.bits & self.value_bits() == self.value_bits()
    }

    /// Returns `true` if any source has completed.
    #[must_use]
    pub fn any_done(self) -> bool {
        self.bits >> MAX_ARITY != 0
    }

    /// Returns `true` once every source has completed.
    #[must_use]
    pub fn all_done(self) -> bool {
        self.bits >> MAX_ARITY == self.value_bits()
    }

    /// Returns the raw bits for persistence.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.bits
    }
}

/// Type-independent upcalls a join child makes into its parent.
///
/// Value delivery is typed per index (a `fn` pointer on the child);
/// completion and error are index- and type-independent.
pub(crate) trait JoinParentCore: Send + Sync + 'static {
    fn child_completed(&self, index: usize);
    fn child_error(&self, error: OperatorError);
}

/// The indexed child observer shared by every arity.
pub(crate) struct JoinChild<P, T> {
    parent: Arc<P>,
    index: usize,
    deliver: fn(&P, T),
}

impl<P: JoinParentCore, T: Send + 'static> Observer<T> for JoinChild<P, T> {
    fn on_next(&self, value: T) {
        (self.deliver)(&self.parent, value);
    }

    fn on_error(&self, error: OperatorError) {
        self.parent.child_error(error);
    }

    fn on_completed(&self) {
        self.parent.child_completed(self.index);
    }
}

macro_rules! combine_latest_arity {
    (
        $name:ident, $op:ident, $state:ident, $node_name:expr, $arity:expr,
        $( ($T:ident, $src:ident, $method:ident, $idx:tt) ),+
    ) => {
        #[doc = concat!(
            "The combine-latest definition over ", stringify!($arity), " sources."
        )]
        pub struct $name<$($T,)+ R> {
            sources: ( $(SubscribableRef<$T>,)+ ),
            combiner: Arc<dyn Fn($(&$T,)+) -> Result<R, OperatorError> + Send + Sync>,
        }

        impl<$($T,)+ R> $name<$($T,)+ R>
        where
            $($T: Clone + Send + StateValue + 'static,)+
            R: Send + 'static,
        {
            /// Creates the join; the combiner runs over the latest value
            /// of every source each time any source produces one (once
            /// all have).
            pub fn new<F>($($src: SubscribableRef<$T>,)+ combiner: F) -> Self
            where
                F: Fn($(&$T,)+) -> Result<R, OperatorError> + Send + Sync + 'static,
            {
                Self {
                    sources: ($($src,)+),
                    combiner: Arc::new(combiner),
                }
            }
        }

        struct $state<$($T,)+> {
            mask: JoinMask,
            latest: ( $(Option<$T>,)+ ),
            terminated: bool,
        }

        struct $op<$($T,)+ R> {
            base: OperatorBase,
            output: ObserverRef<R>,
            combiner: Arc<dyn Fn($(&$T,)+) -> Result<R, OperatorError> + Send + Sync>,
            state: Mutex<$state<$($T,)+>>,
            children: CompositeSubscription,
        }

        impl<$($T,)+ R> $op<$($T,)+ R>
        where
            $($T: Clone + Send + StateValue + 'static,)+
            R: Send + 'static,
        {
            fn terminate(&self) {
                if self.base.begin_dispose() {
                    self.children.dispose();
                }
            }

            $(
                fn $method(&self, value: $T) {
                    let mut state = self.state.lock();
                    if self.base.is_disposed() || state.terminated {
                        return;
                    }
                    state.latest.$idx = Some(value);
                    state.mask.set_value($idx);
                    self.base.mark_dirty();
                    self.after_value(state);
                }
            )+

            /// Runs the post-value transition: combine if the value set
            /// is complete, otherwise complete the join if a source has
            /// already finished. Consumes the state guard.
            fn after_value(
                &self,
                mut state: parking_lot::MutexGuard<'_, $state<$($T,)+>>,
            ) {
                if state.mask.all_values() {
                    let combined = {
                        $(
                            let $src = state
                                .latest
                                .$idx
                                .clone()
                                .expect("has-value bit set without a stored value");
                        )+
                        (self.combiner)($(&$src,)+)
                    };
                    match combined {
                        Ok(result) => self.output.on_next(result),
                        Err(error) => {
                            state.terminated = true;
                            self.output.on_error(error);
                            drop(state);
                            self.terminate();
                        }
                    }
                } else if state.mask.any_done() {
                    // A source already completed and the join never
                    // fired; it never can.
                    state.terminated = true;
                    self.output.on_completed();
                    drop(state);
                    self.terminate();
                }
            }
        }

        impl<$($T,)+ R> JoinParentCore for $op<$($T,)+ R>
        where
            $($T: Clone + Send + StateValue + 'static,)+
            R: Send + 'static,
        {
            fn child_completed(&self, index: usize) {
                let mut state = self.state.lock();
                if self.base.is_disposed() || state.terminated {
                    return;
                }
                state.mask.set_done(index);
                self.base.mark_dirty();
                if state.mask.all_done() || !state.mask.all_values() {
                    state.terminated = true;
                    self.output.on_completed();
                    drop(state);
                    self.terminate();
                }
            }

            fn child_error(&self, error: OperatorError) {
                let mut state = self.state.lock();
                if self.base.is_disposed() || state.terminated {
                    return;
                }
                state.terminated = true;
                self.output.on_error(error);
                drop(state);
                self.terminate();
            }
        }

        impl<$($T,)+ R> Subscribable<R> for $name<$($T,)+ R>
        where
            $($T: Clone + Send + StateValue + 'static,)+
            R: Send + 'static,
        {
            fn subscribe(
                &self,
                output: ObserverRef<R>,
                ctx: &mut SubscribeContext,
            ) -> SubscriptionRef {
                let op = Arc::new($op {
                    base: OperatorBase::new(
                        $node_name,
                        1,
                        ctx.operator_context().clone(),
                    ),
                    output,
                    combiner: Arc::clone(&self.combiner),
                    state: Mutex::new($state {
                        mask: JoinMask::new($arity),
                        latest: ( $(Option::<$T>::None,)+ ),
                        terminated: false,
                    }),
                    children: CompositeSubscription::new(),
                });
                ctx.register(Arc::clone(&op));
                $(
                    let child = Arc::new(JoinChild {
                        parent: Arc::clone(&op),
                        index: $idx,
                        deliver: $op::$method,
                    });
                    op.children.add(self.sources.$idx.subscribe(child, ctx));
                )+
                Arc::new(NodeSubscription::new(op))
            }
        }

        impl<$($T,)+ R> OperatorNode for $op<$($T,)+ R>
        where
            $($T: Clone + Send + StateValue + 'static,)+
            R: Send + 'static,
        {
            fn node_name(&self) -> &'static str {
                self.base.name()
            }

            fn dispose(&self) {
                self.terminate();
            }

            fn is_disposed(&self) -> bool {
                self.base.is_disposed()
            }

            fn state_changed(&self) -> bool {
                self.base.is_dirty()
            }

            fn mark_saved(&self) {
                self.base.mark_saved();
            }

            fn save_state(&self, writer: &mut StateWriter) -> Result<(), StateError> {
                let state = self.state.lock();
                writer.write(&state.mask.bits());
                writer.write(&state.terminated);
                $( writer.write(&state.latest.$idx); )+
                Ok(())
            }

            fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
                let mut state = self.state.lock();
                let bits: u32 = reader.read()?;
                state.mask = JoinMask::restore($arity, bits);
                state.terminated = reader.read()?;
                $( state.latest.$idx = reader.read()?; )+
                Ok(())
            }
        }
    };
}

combine_latest_arity!(
    CombineLatest2, CombineLatest2Op, CombineLatest2State, "rill/combine-latest/2", 2,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1)
);
combine_latest_arity!(
    CombineLatest3, CombineLatest3Op, CombineLatest3State, "rill/combine-latest/3", 3,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2)
);
combine_latest_arity!(
    CombineLatest4, CombineLatest4Op, CombineLatest4State, "rill/combine-latest/4", 4,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3)
);
combine_latest_arity!(
    CombineLatest5, CombineLatest5Op, CombineLatest5State, "rill/combine-latest/5", 5,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4)
);
combine_latest_arity!(
    CombineLatest6, CombineLatest6Op, CombineLatest6State, "rill/combine-latest/6", 6,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5)
);
combine_latest_arity!(
    CombineLatest7, CombineLatest7Op, CombineLatest7State, "rill/combine-latest/7", 7,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6)
);
combine_latest_arity!(
    CombineLatest8, CombineLatest8Op, CombineLatest8State, "rill/combine-latest/8", 8,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7)
);
combine_latest_arity!(
    CombineLatest9, CombineLatest9Op, CombineLatest9State, "rill/combine-latest/9", 9,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8)
);
combine_latest_arity!(
    CombineLatest10, CombineLatest10Op, CombineLatest10State, "rill/combine-latest/10", 10,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9)
);
combine_latest_arity!(
    CombineLatest11, CombineLatest11Op, CombineLatest11State, "rill/combine-latest/11", 11,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10)
);
combine_latest_arity!(
    CombineLatest12, CombineLatest12Op, CombineLatest12State, "rill/combine-latest/12", 12,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10),
    (T11, s11, value_11, 11)
);
combine_latest_arity!(
    CombineLatest13, CombineLatest13Op, CombineLatest13State, "rill/combine-latest/13", 13,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10),
    (T11, s11, value_11, 11), (T12, s12, value_12, 12)
);
combine_latest_arity!(
    CombineLatest14, CombineLatest14Op, CombineLatest14State, "rill/combine-latest/14", 14,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10),
    (T11, s11, value_11, 11), (T12, s12, value_12, 12), (T13, s13, value_13, 13)
);
combine_latest_arity!(
    CombineLatest15, CombineLatest15Op, CombineLatest15State, "rill/combine-latest/15", 15,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10),
    (T11, s11, value_11, 11), (T12, s12, value_12, 12), (T13, s13, value_13, 13),
    (T14, s14, value_14, 14)
);
combine_latest_arity!(
    CombineLatest16, CombineLatest16Op, CombineLatest16State, "rill/combine-latest/16", 16,
    (T0, s0, value_0, 0), (T1, s1, value_1, 1), (T2, s2, value_2, 2), (T3, s3, value_3, 3),
    (T4, s4, value_4, 4), (T5, s5, value_5, 5), (T6, s6, value_6, 6), (T7, s7, value_7, 7),
    (T8, s8, value_8, 8), (T9, s9, value_9, 9), (T10, s10, value_10, 10),
    (T11, s11, value_11, 11), (T12, s12, value_12, 12), (T13, s13, value_13, 13),
    (T14, s14, value_14, 14), (T15, s15, value_15, 15)
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    #[test]
    fn test_mask_value_and_done_tracking() {
        let mut mask = JoinMask::new(3);
        assert!(!mask.all_values());
        mask.set_value(0);
        mask.set_value(2);
        assert!(!mask.all_values());
        mask.set_value(1);
        assert!(mask.all_values());

        assert!(!mask.any_done());
        mask.set_done(1);
        assert!(mask.any_done());
        assert!(!mask.all_done());
        mask.set_done(0);
        mask.set_done(2);
        assert!(mask.all_done());
    }

    #[test]
    fn test_mask_restore_round_trip() {
        let mut mask = JoinMask::new(5);
        mask.set_value(3);
        mask.set_done(4);
        let restored = JoinMask::restore(5, mask.bits());
        assert_eq!(restored, mask);
    }

    #[test]
    #[should_panic(expected = "join arity")]
    fn test_mask_rejects_arity_one() {
        let _ = JoinMask::new(1);
    }

    fn build2(
        context: crate::context::OperatorContext,
    ) -> (
        Arc<PushSource<i64>>,
        Arc<PushSource<String>>,
        Arc<RecordingObserver<String>>,
        Pipeline,
    ) {
        let numbers = PushSource::<i64>::new();
        let labels = PushSource::<String>::new();
        let join = CombineLatest2::new(
            numbers.clone() as SubscribableRef<i64>,
            labels.clone() as SubscribableRef<String>,
            |n: &i64, l: &String| Ok(format!("{l}={n}")),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&join, observer.clone(), context);
        pipeline.start().unwrap();
        (numbers, labels, observer, pipeline)
    }

    #[test]
    fn test_no_result_until_all_sources_have_values() {
        let (_scheduler, context) = test_context();
        let (numbers, labels, observer, _pipeline) = build2(context);

        numbers.push(1);
        numbers.push(2);
        assert!(observer.is_empty());

        labels.push("a".to_string());
        assert_eq!(observer.values(), vec!["a=2".to_string()]);
    }

    #[test]
    fn test_steady_state_fires_on_every_value() {
        let (_scheduler, context) = test_context();
        let (numbers, labels, observer, _pipeline) = build2(context);

        numbers.push(1);
        labels.push("a".to_string());
        numbers.push(2);
        labels.push("b".to_string());

        assert_eq!(
            observer.values(),
            vec!["a=1".to_string(), "a=2".to_string(), "b=2".to_string()]
        );
    }

    #[test]
    fn test_completion_before_full_value_set_completes_join() {
        let (_scheduler, context) = test_context();
        let (numbers, labels, observer, _pipeline) = build2(context);

        numbers.push(1);
        // Labels completes having produced nothing: no combination is
        // ever possible.
        labels.complete();

        assert!(observer.values().is_empty());
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
        // Children were torn down.
        assert_eq!(numbers.observer_count(), 0);
    }

    #[test]
    fn test_all_sources_completing_completes_join() {
        let (_scheduler, context) = test_context();
        let (numbers, labels, observer, _pipeline) = build2(context);

        numbers.push(1);
        labels.push("a".to_string());
        numbers.complete();
        assert!(!observer.is_completed());
        labels.complete();
        assert!(observer.is_completed());
        assert_eq!(observer.values(), vec!["a=1".to_string()]);
    }

    #[test]
    fn test_child_error_tears_down_join() {
        let (_scheduler, context) = test_context();
        let (numbers, labels, observer, _pipeline) = build2(context);

        numbers.push(1);
        labels.error(OperatorError::user("label feed failed"));

        assert!(matches!(
            observer.error(),
            Some(OperatorError::UserFunction { .. })
        ));
        assert_eq!(numbers.observer_count(), 0);
        assert_eq!(labels.observer_count(), 0);
    }

    #[test]
    fn test_combiner_failure_is_terminal() {
        let (_scheduler, context) = test_context();
        let a = PushSource::<i64>::new();
        let b = PushSource::<i64>::new();
        let join = CombineLatest2::new(
            a.clone() as SubscribableRef<i64>,
            b.clone() as SubscribableRef<i64>,
            |x: &i64, y: &i64| {
                x.checked_add(*y)
                    .ok_or(OperatorError::Overflow {
                        operator: "rill/combine-latest/2",
                    })
            },
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&join, observer.clone(), context);
        pipeline.start().unwrap();

        a.push(i64::MAX);
        b.push(1);

        assert!(matches!(
            observer.error(),
            Some(OperatorError::Overflow { .. })
        ));
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_three_way_join() {
        let (_scheduler, context) = test_context();
        let a = PushSource::<i64>::new();
        let b = PushSource::<i64>::new();
        let c = PushSource::<i64>::new();
        let join = CombineLatest3::new(
            a.clone() as SubscribableRef<i64>,
            b.clone() as SubscribableRef<i64>,
            c.clone() as SubscribableRef<i64>,
            |x: &i64, y: &i64, z: &i64| Ok(x + y + z),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&join, observer.clone(), context);
        pipeline.start().unwrap();

        a.push(1);
        b.push(10);
        assert!(observer.is_empty());
        c.push(100);
        b.push(20);

        assert_eq!(observer.values(), vec![111, 121]);
    }

    #[test]
    fn test_checkpoint_restores_latest_values() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let (numbers, labels, observer, pipeline) = build2(context.clone());
            numbers.push(5);
            labels.push("x".to_string());
            assert_eq!(observer.values(), vec!["x=5".to_string()]);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.dispose();
        }

        // The recovered join is already in steady state: one new value
        // from either source combines with the restored latest values.
        let numbers = PushSource::<i64>::new();
        let labels = PushSource::<String>::new();
        let join = CombineLatest2::new(
            numbers.clone() as SubscribableRef<i64>,
            labels.clone() as SubscribableRef<String>,
            |n: &i64, l: &String| Ok(format!("{l}={n}")),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&join, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        numbers.push(6);
        assert_eq!(observer.values(), vec!["x=6".to_string()]);
    }
}
