use std::fmt;

use snafu::OptionExt as _;

use crate::error::{TrackValueError, Unparseable};

/// A value tracked by application code.
///
/// Integers and floating-point numbers convert directly into the numeric domain of an aggregator, while text is parsed
/// as a floating-point number when a numeric value is required. Distinct-count aggregators use the textual
/// representation of every variant.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackedValue {
    /// A floating-point number.
    Float(f64),

    /// A signed integer.
    Signed(i64),

    /// An unsigned integer.
    Unsigned(u64),

    /// Text.
    Text(String),
}

impl TrackedValue {
    /// Returns `true` if this value is a floating-point NaN.
    ///
    /// NaN values carry no information and are ignored by every aggregator.
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float(value) if value.is_nan())
    }

    /// Converts this value to a floating-point number.
    ///
    /// # Errors
    ///
    /// If the value is text that cannot be parsed as a number, an error is returned.
    pub fn to_f64(&self) -> Result<f64, TrackValueError> {
        match self {
            Self::Float(value) => Ok(*value),
            Self::Signed(value) => Ok(*value as f64),
            Self::Unsigned(value) => Ok(*value as f64),
            Self::Text(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .context(Unparseable { value: text.as_str() }),
        }
    }
}

impl fmt::Display for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(value) => write!(f, "{}", value),
            Self::Signed(value) => write!(f, "{}", value),
            Self::Unsigned(value) => write!(f, "{}", value),
            Self::Text(text) => f.write_str(text),
        }
    }
}

macro_rules! impl_from {
    ($variant:ident($target:ty) <= $($source:ty),+) => {
        $(
            impl From<$source> for TrackedValue {
                fn from(value: $source) -> Self {
                    Self::$variant(<$target>::from(value))
                }
            }
        )+
    };
}

impl_from!(Float(f64) <= f64, f32);
impl_from!(Signed(i64) <= i64, i32, i16, i8);
impl_from!(Unsigned(u64) <= u64, u32, u16, u8);

impl From<&str> for TrackedValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TrackedValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
