//! One-or-many argument normalization.
//!
//! Callers may pass a single value or a list wherever the model has one
//! input (or output). The engine normalizes both forms into a `Vec` once,
//! at the boundary, and restores the caller's form on the way out.

use ndarray::ArrayD;

use crate::error::{Result, VisError};

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq)]
pub enum OneOrMany<T> {
    /// A bare value.
    Single(T),
    /// A list of values, possibly of length one.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    /// Whether there are no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the list form was used.
    #[must_use]
    pub const fn is_many(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    /// The bare value, if the single form was used.
    #[must_use]
    pub fn single(&self) -> Option<&T> {
        match self {
            Self::Single(item) => Some(item),
            Self::Many(_) => None,
        }
    }

    /// The list, if the list form was used.
    #[must_use]
    pub fn many(&self) -> Option<&[T]> {
        match self {
            Self::Single(_) => None,
            Self::Many(items) => Some(items),
        }
    }

    /// Consume and return the bare value.
    ///
    /// # Errors
    ///
    /// Returns an error if the list form was used.
    pub fn into_single(self) -> Result<T> {
        match self {
            Self::Single(item) => Ok(item),
            Self::Many(items) => Err(VisError::invalid(format!(
                "expected a single value, got a list of {}",
                items.len()
            ))),
        }
    }

    /// Normalize to a list, remembering whether the list form was used.
    #[must_use]
    pub fn into_vec(self) -> (Vec<T>, bool) {
        match self {
            Self::Single(item) => (vec![item], false),
            Self::Many(items) => (items, true),
        }
    }

    /// Inverse of [`OneOrMany::into_vec`].
    ///
    /// A one-element list is unwrapped unless `was_many` is set.
    #[must_use]
    pub fn restore(mut items: Vec<T>, was_many: bool) -> Self {
        if !was_many && items.len() == 1 {
            if let Some(item) = items.pop() {
                return Self::Single(item);
            }
        }
        Self::Many(items)
    }

    /// Map every value.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> OneOrMany<U> {
        match self {
            Self::Single(item) => OneOrMany::Single(f(item)),
            Self::Many(items) => OneOrMany::Many(items.into_iter().map(f).collect()),
        }
    }
}

impl<T> OneOrMany<Option<T>> {
    /// Normalize an argument against the model's arity.
    ///
    /// The bare form is only accepted when `expected == 1`; the list form
    /// must have exactly `expected` entries. Missing entries are rejected.
    ///
    /// Returns the values and whether the list form was used.
    pub fn normalize(self, expected: usize, what: &str) -> Result<(Vec<T>, bool)> {
        let (items, was_many) = self.into_vec();
        if !was_many && expected != 1 {
            return Err(VisError::invalid(format!(
                "the model has {expected} {what}s, so a list of {expected} {what}s is required"
            )));
        }
        if items.len() != expected {
            return Err(VisError::invalid(format!(
                "expected {expected} {what}(s), got {}",
                items.len()
            )));
        }
        let items = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                item.ok_or_else(|| VisError::invalid(format!("{what} {i} is missing")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((items, was_many))
    }
}

impl From<ArrayD<f32>> for OneOrMany<Option<ArrayD<f32>>> {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Single(Some(value))
    }
}

impl<T> From<Option<T>> for OneOrMany<Option<T>> {
    fn from(value: Option<T>) -> Self {
        Self::Single(value)
    }
}

impl<T> From<Vec<T>> for OneOrMany<Option<T>> {
    fn from(values: Vec<T>) -> Self {
        Self::Many(values.into_iter().map(Some).collect())
    }
}

impl<T> From<Vec<Option<T>>> for OneOrMany<Option<T>> {
    fn from(values: Vec<Option<T>>) -> Self {
        Self::Many(values)
    }
}

/// Seed input argument: one tensor, or one per model input.
pub type SeedInputs = OneOrMany<Option<ArrayD<f32>>>;
