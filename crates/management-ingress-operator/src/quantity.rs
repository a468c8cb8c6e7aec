//! Parsing of Kubernetes resource quantities into comparable values.
//!
//! The API server stores quantities in a canonical form (`1024Mi` becomes `1Gi`, `0.5`
//! becomes `500m`), so two quantities have to be compared by value, not by their text.
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use snafu::{ResultExt as _, Snafu, ensure};

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseQuantityError {
    #[snafu(display("input is either empty or contains non-ascii characters"))]
    InvalidFormat,

    #[snafu(display("failed to parse floating point number"))]
    InvalidFloat { source: std::num::ParseFloatError },

    #[snafu(display("failed to parse {input:?} as quantity suffix"))]
    InvalidSuffix { input: String },
}

/// A parsed quantity, scaled to its base unit (bytes, cores, ...).
///
/// Values are kept as `f64`, use [`Quantity::is_equivalent`] to compare them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantity {
    value: f64,
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(!input.is_empty() && input.is_ascii(), InvalidFormatSnafu);

        let (sign, unsigned) = match input.strip_prefix('-') {
            Some(rest) => (-1.0, rest),
            None => (1.0, input.strip_prefix('+').unwrap_or(input)),
        };
        let suffix_index = unsigned
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(suffix_index);

        let value = f64::from_str(number).context(InvalidFloatSnafu)?;
        Ok(Self {
            value: sign * value * suffix_factor(suffix)?,
        })
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = ParseQuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Self::from_str(&value.0)
    }
}

impl Quantity {
    /// Whether both quantities denote the same amount, allowing for the rounding of
    /// decimal suffixes like `m`.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let tolerance = f64::EPSILON * 4.0 * self.value.abs().max(other.value.abs());
        (self.value - other.value).abs() <= tolerance
    }
}

/// Byte-multiples based on powers of 2, as adopted by Kubernetes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
enum BinaryMultiple {
    #[strum(serialize = "Ki")]
    Kibi,
    #[strum(serialize = "Mi")]
    Mebi,
    #[strum(serialize = "Gi")]
    Gibi,
    #[strum(serialize = "Ti")]
    Tebi,
    #[strum(serialize = "Pi")]
    Pebi,
    #[strum(serialize = "Ei")]
    Exbi,
}

impl BinaryMultiple {
    fn factor(self) -> f64 {
        let exponent = match self {
            BinaryMultiple::Kibi => 10,
            BinaryMultiple::Mebi => 20,
            BinaryMultiple::Gibi => 30,
            BinaryMultiple::Tebi => 40,
            BinaryMultiple::Pebi => 50,
            BinaryMultiple::Exbi => 60,
        };
        2f64.powi(exponent)
    }
}

/// Multiples based on powers of 10. Note that 1000 is `k`, not `K`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
enum DecimalMultiple {
    #[strum(serialize = "n")]
    Nano,
    #[strum(serialize = "u")]
    Micro,
    #[strum(serialize = "m")]
    Milli,
    #[strum(serialize = "")]
    Empty,
    #[strum(serialize = "k")]
    Kilo,
    #[strum(serialize = "M")]
    Mega,
    #[strum(serialize = "G")]
    Giga,
    #[strum(serialize = "T")]
    Tera,
    #[strum(serialize = "P")]
    Peta,
    #[strum(serialize = "E")]
    Exa,
}

impl DecimalMultiple {
    fn factor(self) -> f64 {
        let exponent = match self {
            DecimalMultiple::Nano => -9,
            DecimalMultiple::Micro => -6,
            DecimalMultiple::Milli => -3,
            DecimalMultiple::Empty => 0,
            DecimalMultiple::Kilo => 3,
            DecimalMultiple::Mega => 6,
            DecimalMultiple::Giga => 9,
            DecimalMultiple::Tera => 12,
            DecimalMultiple::Peta => 15,
            DecimalMultiple::Exa => 18,
        };
        10f64.powi(exponent)
    }
}

fn suffix_factor(suffix: &str) -> Result<f64, ParseQuantityError> {
    if let Ok(binary) = BinaryMultiple::from_str(suffix) {
        return Ok(binary.factor());
    }
    if let Ok(decimal) = DecimalMultiple::from_str(suffix) {
        return Ok(decimal.factor());
    }
    // Scientific notation, e.g. `1e3`
    if let Some(exponent) = suffix
        .strip_prefix(['e', 'E'])
        .and_then(|exponent| i32::from_str(exponent).ok())
    {
        return Ok(10f64.powi(exponent));
    }

    InvalidSuffixSnafu { input: suffix }.fail()
}
