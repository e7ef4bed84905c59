//! Distinctness Rules
//!
//! A distinctness rule decides whether a candidate value should be suppressed
//! because it is "the same" as the node's previous value. A suppressed value
//! counts as not resolved for the current cycle.

use std::fmt;
use std::rc::Rc;

use super::Value;

/// Type-erased comparator: `(previous, next) -> suppress`.
pub(crate) type Comparator = Rc<dyn Fn(Option<&Value>, &Value) -> bool>;

/// How a node decides whether a new value is worth emitting.
pub enum Distinct<T> {
    /// Always emit.
    Never,

    /// Suppress when the predicate returns `true` for
    /// `(previous value if any, next value)`.
    By(Rc<dyn Fn(Option<&T>, &T) -> bool>),
}

impl<T: 'static> Distinct<T> {
    /// Use a custom predicate.
    pub fn by(predicate: impl Fn(Option<&T>, &T) -> bool + 'static) -> Self {
        Distinct::By(Rc::new(predicate))
    }

    pub(crate) fn into_comparator(self) -> Option<Comparator> {
        match self {
            Distinct::Never => None,
            Distinct::By(predicate) => {
                let comparator: Comparator = Rc::new(move |previous, next| {
                    match next.downcast_ref::<T>() {
                        Some(next) => predicate(previous.and_then(|p| p.downcast_ref::<T>()), next),
                        None => false,
                    }
                });
                Some(comparator)
            }
        }
    }
}

impl<T: PartialEq + 'static> Distinct<T> {
    /// Suppress values equal to the previous one. The default for cells.
    pub fn by_eq() -> Self {
        Self::by(|previous, next| previous == Some(next))
    }
}

impl<T> Clone for Distinct<T> {
    fn clone(&self) -> Self {
        match self {
            Distinct::Never => Distinct::Never,
            Distinct::By(predicate) => Distinct::By(Rc::clone(predicate)),
        }
    }
}

impl<T> fmt::Debug for Distinct<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distinct::Never => f.write_str("Distinct::Never"),
            Distinct::By(_) => f.write_str("Distinct::By(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_eq_suppresses_equal_values_only() {
        let cmp = Distinct::<i32>::by_eq().into_comparator().unwrap();
        let one = Value::new(1);
        assert!(cmp(Some(&one), &Value::new(1)));
        assert!(!cmp(Some(&one), &Value::new(2)));
        assert!(!cmp(None, &Value::new(1)));
    }

    #[test]
    fn never_has_no_comparator() {
        assert!(Distinct::<i32>::Never.into_comparator().is_none());
    }

    #[test]
    fn custom_predicates_see_the_absent_previous() {
        let cmp = Distinct::<i32>::by(|previous, next| previous.is_none() && *next == 0)
            .into_comparator()
            .unwrap();
        assert!(cmp(None, &Value::new(0)));
        assert!(!cmp(Some(&Value::new(0)), &Value::new(0)));
    }
}
