//! Numeric accumulators: sum, min, max, average, and their nullable
//! forms.
//!
//! The whole family is one generic implementation over the [`Numeric`]
//! capability set — zero, checked addition, a NaN predicate, and a total
//! ordering — instead of a per-type fan-out. Nullable variants wrap the
//! non-nullable accumulator generically and turn its empty-sequence
//! fault into a `None` result.
//!
//! ## NaN policy
//!
//! Min/max comparisons use [`Numeric::cmp_nan_smallest`], which orders
//! NaN below every other value *including negative infinity*. Native
//! float comparisons do not encode this (NaN is unordered under
//! `PartialOrd`, and `f64::total_cmp` splits NaN across both ends), so
//! the trait supplies the order explicitly. The observable results:
//! `min` returns NaN if any NaN is present; `max` never returns NaN
//! unless the whole sequence is NaN.
//!
//! ## Overflow
//!
//! Integer accumulation is checked; overflow surfaces as
//! [`OperatorError::Overflow`], terminal for the operator. Float
//! addition saturates to infinities and never faults.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::operator::aggregate::{UnaryAccumulator, UnaryFold};
use crate::operator::OperatorError;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::SubscribableRef;

/// The capability set the numeric operators need from an element type.
pub trait Numeric:
    Copy + PartialEq + Send + Sync + StateValue + std::fmt::Debug + 'static
{
    /// The additive identity.
    const ZERO: Self;

    /// Checked addition; `None` means the representation overflowed.
    fn checked_add(self, other: Self) -> Option<Self>;

    /// Returns `true` for floating NaN values.
    fn is_nan(self) -> bool;

    /// Total ordering with NaN below everything, including `-inf`.
    fn cmp_nan_smallest(self, other: Self) -> Ordering;

    /// Widens to `f64` for averaging.
    fn to_f64(self) -> f64;
}

macro_rules! integer_numeric {
    ($ty:ty) => {
        impl Numeric for $ty {
            const ZERO: Self = 0;

            fn checked_add(self, other: Self) -> Option<Self> {
                <$ty>::checked_add(self, other)
            }

            fn is_nan(self) -> bool {
                false
            }

            fn cmp_nan_smallest(self, other: Self) -> Ordering {
                Ord::cmp(&self, &other)
            }

            #[allow(clippy::cast_precision_loss)]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

integer_numeric!(i32);
integer_numeric!(i64);

macro_rules! float_numeric {
    ($ty:ty) => {
        impl Numeric for $ty {
            const ZERO: Self = 0.0;

            fn checked_add(self, other: Self) -> Option<Self> {
                // Float addition saturates to infinity; never a fault.
                Some(self + other)
            }

            fn is_nan(self) -> bool {
                <$ty>::is_nan(self)
            }

            fn cmp_nan_smallest(self, other: Self) -> Ordering {
                match (<$ty>::is_nan(self), <$ty>::is_nan(other)) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => {
                        self.partial_cmp(&other).unwrap_or(Ordering::Equal)
                    }
                }
            }

            fn to_f64(self) -> f64 {
                f64::from(self)
            }
        }
    };
}

float_numeric!(f32);
float_numeric!(f64);

/// Checked running sum; an empty source yields zero.
pub struct SumAcc<N> {
    sum: N,
}

impl<N: Numeric> UnaryAccumulator for SumAcc<N> {
    type In = N;
    type Out = N;

    const NAME: &'static str = "rill/sum";

    fn accumulate(&mut self, value: &N) -> Result<(), OperatorError> {
        self.sum = self
            .sum
            .checked_add(*value)
            .ok_or(OperatorError::Overflow { operator: Self::NAME })?;
        Ok(())
    }

    fn finish(&self) -> Result<N, OperatorError> {
        Ok(self.sum)
    }

    fn save(&self, writer: &mut StateWriter) {
        writer.write(&self.sum);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.sum = reader.read()?;
        Ok(())
    }
}

/// Selects which side of the total order an extremum accumulator keeps.
pub trait ExtremumPolicy: Send + 'static {
    /// Operator name for node keys and blob headers.
    const NAME: &'static str;

    /// Returns `true` when a candidate ordered `ordering` against the
    /// current best should replace it.
    fn keeps(ordering: Ordering) -> bool;
}

/// Keeps the smallest value.
pub struct MinPolicy;

impl ExtremumPolicy for MinPolicy {
    const NAME: &'static str = "rill/min";

    fn keeps(ordering: Ordering) -> bool {
        ordering == Ordering::Less
    }
}

/// Keeps the largest value.
pub struct MaxPolicy;

impl ExtremumPolicy for MaxPolicy {
    const NAME: &'static str = "rill/max";

    fn keeps(ordering: Ordering) -> bool {
        ordering == Ordering::Greater
    }
}

/// Running extremum under the NaN-smallest total order.
pub struct ExtremumAcc<N, P> {
    best: Option<N>,
    _policy: std::marker::PhantomData<P>,
}

impl<N, P> ExtremumAcc<N, P> {
    fn empty() -> Self {
        Self {
            best: None,
            _policy: std::marker::PhantomData,
        }
    }
}

impl<N: Numeric, P: ExtremumPolicy> UnaryAccumulator for ExtremumAcc<N, P> {
    type In = N;
    type Out = N;

    const NAME: &'static str = P::NAME;

    fn accumulate(&mut self, value: &N) -> Result<(), OperatorError> {
        self.best = Some(match self.best {
            None => *value,
            Some(current) if P::keeps(value.cmp_nan_smallest(current)) => *value,
            Some(current) => current,
        });
        Ok(())
    }

    fn finish(&self) -> Result<N, OperatorError> {
        self.best.ok_or(OperatorError::EmptySequence)
    }

    fn save(&self, writer: &mut StateWriter) {
        writer.write(&self.best);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.best = reader.read()?;
        Ok(())
    }
}

/// Running `(sum, count)` pair; the result is the `f64` mean.
pub struct AverageAcc<N> {
    sum: N,
    count: u64,
}

impl<N: Numeric> UnaryAccumulator for AverageAcc<N> {
    type In = N;
    type Out = f64;

    const NAME: &'static str = "rill/average";

    fn accumulate(&mut self, value: &N) -> Result<(), OperatorError> {
        self.sum = self
            .sum
            .checked_add(*value)
            .ok_or(OperatorError::Overflow { operator: Self::NAME })?;
        self.count += 1;
        Ok(())
    }

    fn finish(&self) -> Result<f64, OperatorError> {
        if self.count == 0 {
            return Err(OperatorError::EmptySequence);
        }
        #[allow(clippy::cast_precision_loss)]
        Ok(self.sum.to_f64() / self.count as f64)
    }

    fn save(&self, writer: &mut StateWriter) {
        // Count before sum would also work; keep declaration order.
        writer.write(&self.sum);
        writer.write(&self.count);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.sum = reader.read()?;
        self.count = reader.read()?;
        Ok(())
    }
}

/// Generic nullable wrapper: skips `None` elements and maps the inner
/// accumulator's empty-sequence fault to a `None` result.
pub struct NullableAcc<A> {
    inner: A,
}

impl<A: UnaryAccumulator> UnaryAccumulator for NullableAcc<A> {
    type In = Option<A::In>;
    type Out = Option<A::Out>;

    const NAME: &'static str = A::NAME;

    fn accumulate(&mut self, value: &Option<A::In>) -> Result<(), OperatorError> {
        match value {
            Some(inner_value) => self.inner.accumulate(inner_value),
            None => Ok(()),
        }
    }

    fn finish(&self) -> Result<Option<A::Out>, OperatorError> {
        match self.inner.finish() {
            Ok(result) => Ok(Some(result)),
            Err(OperatorError::EmptySequence) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn save(&self, writer: &mut StateWriter) {
        self.inner.save(writer);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.inner.load(reader)
    }
}

/// Sums `source`; an empty source yields zero.
pub fn sum<N: Numeric>(source: SubscribableRef<N>) -> UnaryFold<SumAcc<N>> {
    UnaryFold::new(source, Arc::new(|| SumAcc { sum: N::ZERO }))
}

/// Minimum of `source`; NaN compares below everything, and an empty
/// source faults.
pub fn min<N: Numeric>(source: SubscribableRef<N>) -> UnaryFold<ExtremumAcc<N, MinPolicy>> {
    UnaryFold::new(source, Arc::new(|| ExtremumAcc::empty()))
}

/// Maximum of `source`; NaN compares below everything, and an empty
/// source faults.
pub fn max<N: Numeric>(source: SubscribableRef<N>) -> UnaryFold<ExtremumAcc<N, MaxPolicy>> {
    UnaryFold::new(source, Arc::new(|| ExtremumAcc::empty()))
}

/// Mean of `source` as `f64`; an empty source faults.
pub fn average<N: Numeric>(source: SubscribableRef<N>) -> UnaryFold<AverageAcc<N>> {
    UnaryFold::new(
        source,
        Arc::new(|| AverageAcc {
            sum: N::ZERO,
            count: 0,
        }),
    )
}

/// Sums the non-null elements; all-null or empty yields `Some(zero)`.
pub fn sum_nullable<N: Numeric>(
    source: SubscribableRef<Option<N>>,
) -> UnaryFold<NullableAcc<SumAcc<N>>> {
    UnaryFold::new(
        source,
        Arc::new(|| NullableAcc {
            inner: SumAcc { sum: N::ZERO },
        }),
    )
}

/// Minimum of the non-null elements; all-null or empty yields `None`.
pub fn min_nullable<N: Numeric>(
    source: SubscribableRef<Option<N>>,
) -> UnaryFold<NullableAcc<ExtremumAcc<N, MinPolicy>>> {
    UnaryFold::new(
        source,
        Arc::new(|| NullableAcc {
            inner: ExtremumAcc::empty(),
        }),
    )
}

/// Maximum of the non-null elements; all-null or empty yields `None`.
pub fn max_nullable<N: Numeric>(
    source: SubscribableRef<Option<N>>,
) -> UnaryFold<NullableAcc<ExtremumAcc<N, MaxPolicy>>> {
    UnaryFold::new(
        source,
        Arc::new(|| NullableAcc {
            inner: ExtremumAcc::empty(),
        }),
    )
}

/// Mean of the non-null elements; all-null or empty yields `None`.
pub fn average_nullable<N: Numeric>(
    source: SubscribableRef<Option<N>>,
) -> UnaryFold<NullableAcc<AverageAcc<N>>> {
    UnaryFold::new(
        source,
        Arc::new(|| NullableAcc {
            inner: AverageAcc {
                sum: N::ZERO,
                count: 0,
            },
        }),
    )
}
