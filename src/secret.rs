//! A newtype for passwords handed to external tools.
//!
//! Formatting a [`Secret`] prints `***`. The only way to get the value is
//! [`Secret::expose`], which the command runner calls when it writes the
//! argument vector or the child's stdin.

use std::fmt;
use std::str::FromStr;

/// A wrapper around `String` that redacts its value in `Debug` and `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Create a new `Secret` from a `String`.
    ///
    /// A trailing line break (as read from a terminal or a pipe) is removed.
    pub fn new(mut value: String) -> Self {
        let trimmed = value.trim_end_matches(&['\r', '\n'][..]).len();
        value.truncate(trimmed);
        Self(value)
    }

    /// Return the inner value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `true` for an empty password.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.to_string()))
    }
}
