//! Pluggable policies injected into the pool at construction.
//!
//! - [`SuccessPredicate`]: decides whether a fetched value is published
//! - [`PriorityDecay`]: lowers the urgency of a task that will be retried
//! - [`YieldPoint`]: the point between "fetch returned" and "outcome
//!   committed" where a pending cancellation gets observed
//!
//! Each has a default implementation and accepts plain closures.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use super::config::ConfigError;
use super::execution::CancelSignal;

/// Default multiplicative decay factor.
pub const DEFAULT_DECAY_FACTOR: f64 = 1.1;

/// Classifies a fetched value as acceptable or not.
pub trait SuccessPredicate<V>: Send + Sync + 'static {
    /// Returns true when the value should be published.
    fn evaluate(&self, value: &V) -> bool;
}

impl<V, F> SuccessPredicate<V> for F
where
    F: Fn(&V) -> bool + Send + Sync + 'static,
{
    fn evaluate(&self, value: &V) -> bool {
        self(value)
    }
}

/// Truthiness of a value: zero, empty, `None`, `false` and `null` are falsy.
pub trait Truthiness {
    /// Returns whether the value counts as a successful fetch.
    fn is_truthy(&self) -> bool;
}

/// Default predicate: accepts truthy values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Truthy;

impl<V: Truthiness> SuccessPredicate<V> for Truthy {
    fn evaluate(&self, value: &V) -> bool {
        value.is_truthy()
    }
}

impl Truthiness for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl Truthiness for () {
    fn is_truthy(&self) -> bool {
        false
    }
}

macro_rules! impl_truthiness_for_numbers {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Truthiness for $ty {
                fn is_truthy(&self) -> bool {
                    *self != (0 as $ty)
                }
            }
        )*
    };
}

impl_truthiness_for_numbers!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64
);

macro_rules! impl_truthiness_for_collections {
    ($($ty:ty => [$($param:ident),*]),* $(,)?) => {
        $(
            impl<$($param),*> Truthiness for $ty {
                fn is_truthy(&self) -> bool {
                    !self.is_empty()
                }
            }
        )*
    };
}

impl_truthiness_for_collections!(
    Vec<T> => [T],
    VecDeque<T> => [T],
    HashSet<T, S> => [T, S],
    BTreeSet<T> => [T],
    HashMap<K, W, S> => [K, W, S],
    BTreeMap<K, W> => [K, W],
);

impl Truthiness for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthiness for str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthiness for [T] {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Truthiness> Truthiness for Option<T> {
    fn is_truthy(&self) -> bool {
        self.as_ref().is_some_and(Truthiness::is_truthy)
    }
}

impl<T: Truthiness + ?Sized> Truthiness for &T {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Box<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Rc<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Arc<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl Truthiness for serde_json::Value {
    fn is_truthy(&self) -> bool {
        match self {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
        }
    }
}

/// Maps a priority to a less urgent one when a task is retried.
pub trait PriorityDecay: Send + Sync + 'static {
    /// Returns the priority for the next attempt.
    fn decay(&self, priority: f64) -> f64;
}

impl<F> PriorityDecay for F
where
    F: Fn(f64) -> f64 + Send + Sync + 'static,
{
    fn decay(&self, priority: f64) -> f64 {
        self(priority)
    }
}

/// Default decay: multiply positive priorities by a factor above one.
///
/// Zero is a fixed point of multiplication and negative priorities would
/// become more urgent, so non-positive priorities are shifted up by
/// `factor - 1` instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplicativeDecay {
    factor: f64,
}

impl Default for MultiplicativeDecay {
    fn default() -> Self {
        Self {
            factor: DEFAULT_DECAY_FACTOR,
        }
    }
}

impl MultiplicativeDecay {
    /// Creates a decay policy with the given factor.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` unless the factor is finite and
    /// greater than one.
    pub fn new(factor: f64) -> Result<Self, ConfigError> {
        if !factor.is_finite() || factor <= 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "decay_factor".to_string(),
                message: format!("must be finite and greater than 1, got {}", factor),
            });
        }
        Ok(Self { factor })
    }

    /// The multiplication factor.
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl PriorityDecay for MultiplicativeDecay {
    fn decay(&self, priority: f64) -> f64 {
        if priority > 0.0 {
            priority * self.factor
        } else {
            priority + (self.factor - 1.0)
        }
    }
}

/// Result of passing a yield point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// No cancellation was observed; commit the fetched value.
    Continue,
    /// Cancellation landed before the value was committed.
    Cancelled,
}

/// The point between a fetch returning and its outcome being committed.
///
/// Implementations decide whether a pending cancellation is observed there.
/// Swapping the implementation lets tests construct the completion/cancel
/// race deterministically.
pub trait YieldPoint: Send + Sync + 'static {
    /// Passes the yield point for one execution.
    fn pass(&self, cancel: &CancelSignal) -> Checkpoint;
}

/// Default yield point: yields the thread, then observes cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerYield;

impl YieldPoint for SchedulerYield {
    fn pass(&self, cancel: &CancelSignal) -> Checkpoint {
        std::thread::yield_now();
        if cancel.is_cancelled() {
            Checkpoint::Cancelled
        } else {
            Checkpoint::Continue
        }
    }
}

/// Yield point that never observes cancellation.
///
/// Every value that returns is committed as a success, even when its
/// deadline already elapsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoYield;

impl YieldPoint for NoYield {
    fn pass(&self, _cancel: &CancelSignal) -> Checkpoint {
        Checkpoint::Continue
    }
}
