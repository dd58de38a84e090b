use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;
use std::{num::ParseIntError, sync::OnceLock};

/// Adapted from https://github.com/sombralibre/k8s-quantity-parser
/// MIT licensed, Copyright (c) 2022 Alejandro Llanes
///
/// Extended with fractional amounts, exponent notation, milli precision and canonical formatting
/// so that derived requests keep the notation of the quantity they were computed from.

#[allow(non_camel_case_types)]
enum QuantityUnits {
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
    m,
    Unit,
    k,
    M,
    G,
    T,
    P,
    E,
}

impl QuantityUnits {
    fn new(unit: &str) -> Option<Self> {
        Some(match unit {
            "Ki" => Self::Ki,
            "Mi" => Self::Mi,
            "Gi" => Self::Gi,
            "Ti" => Self::Ti,
            "Pi" => Self::Pi,
            "Ei" => Self::Ei,
            "m" => Self::m,
            "" => Self::Unit,
            "k" => Self::k,
            "M" => Self::M,
            "G" => Self::G,
            "T" => Self::T,
            "P" => Self::P,
            "E" => Self::E,
            _ => return None,
        })
    }

    fn scale(&self) -> Scale {
        match self {
            Self::Ki => Scale::Binary(1),
            Self::Mi => Scale::Binary(2),
            Self::Gi => Scale::Binary(3),
            Self::Ti => Scale::Binary(4),
            Self::Pi => Scale::Binary(5),
            Self::Ei => Scale::Binary(6),
            Self::m => Scale::Decimal(-3),
            Self::Unit => Scale::Decimal(0),
            Self::k => Scale::Decimal(3),
            Self::M => Scale::Decimal(6),
            Self::G => Scale::Decimal(9),
            Self::T => Scale::Decimal(12),
            Self::P => Scale::Decimal(15),
            Self::E => Scale::Decimal(18),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// Power of 1024
    Binary(u32),
    /// Power of 10
    Decimal(i32),
}

/// The notation a quantity was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityFormat {
    /// e.g. 12Mi
    BinarySI,
    /// e.g. 12M, 200m
    DecimalSI,
    /// e.g. 12e6
    DecimalExponent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseIntError(#[from] ParseIntError),
    #[error("Invalid quantity format")]
    InvalidFormat,
    #[error("Invalid quantity unit")]
    InvalidUnit,
    #[error("Quantity out of range")]
    OutOfRange,
}

struct ParsedQuantity {
    negative: bool,
    digits: i128,
    fraction_len: u32,
    scale: Scale,
    format: QuantityFormat,
}

fn parse(quantity: &str) -> Result<ParsedQuantity, ParseError> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let captures = REGEX
        .get_or_init(|| {
            Regex::new(r"^([+-]?)([0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE]([+-]?[0-9]+)|([a-zA-Z]*))$")
                .expect("quantity regex to compile")
        })
        .captures(quantity.trim())
        .ok_or(ParseError::InvalidFormat)?;

    let negative = &captures[1] == "-";
    let (integer, fraction) = captures[2].split_once('.').unwrap_or((&captures[2], ""));

    let all_digits = format!("{integer}{fraction}");
    let trimmed = all_digits.trim_start_matches('0');
    if trimmed.len() > 30 {
        return Err(ParseError::OutOfRange);
    }
    let digits = if trimmed.is_empty() {
        0
    } else {
        trimmed.parse::<i128>()?
    };
    let fraction_len = u32::try_from(fraction.len()).map_err(|_| ParseError::OutOfRange)?;

    let (scale, format) = if let Some(exponent) = captures.get(3) {
        let exponent = exponent.as_str().parse::<i32>()?;
        (Scale::Decimal(exponent), QuantityFormat::DecimalExponent)
    } else {
        let suffix = captures.get(4).map_or("", |m| m.as_str());
        let unit = QuantityUnits::new(suffix).ok_or(ParseError::InvalidUnit)?;
        let scale = unit.scale();
        let format = match scale {
            Scale::Binary(_) => QuantityFormat::BinarySI,
            Scale::Decimal(_) => QuantityFormat::DecimalSI,
        };
        (scale, format)
    };

    Ok(ParsedQuantity {
        negative,
        digits,
        fraction_len,
        scale,
        format,
    })
}

fn pow10(exponent: u32) -> Result<i128, ParseError> {
    10i128.checked_pow(exponent).ok_or(ParseError::OutOfRange)
}

fn div_ceil(numerator: i128, denominator: i128) -> i128 {
    (numerator + denominator - 1) / denominator
}

impl ParsedQuantity {
    /// Thousandths of the unit, rounded up in magnitude
    fn millis(&self) -> Result<i128, ParseError> {
        let magnitude = match self.scale {
            Scale::Decimal(exponent) => {
                let power = i64::from(exponent) + 3 - i64::from(self.fraction_len);
                let power_abs = u32::try_from(power.unsigned_abs()).map_err(|_| ParseError::OutOfRange)?;
                if power >= 0 {
                    self.digits
                        .checked_mul(pow10(power_abs)?)
                        .ok_or(ParseError::OutOfRange)?
                } else {
                    div_ceil(self.digits, pow10(power_abs)?)
                }
            }
            Scale::Binary(power) => {
                let multiplier = 1024i128
                    .checked_pow(power)
                    .and_then(|m| m.checked_mul(1000))
                    .ok_or(ParseError::OutOfRange)?;
                let scaled = self
                    .digits
                    .checked_mul(multiplier)
                    .ok_or(ParseError::OutOfRange)?;
                div_ceil(scaled, pow10(self.fraction_len)?)
            }
        };
        Ok(if self.negative { -magnitude } else { magnitude })
    }
}

/// This trait works as a parser for the values held in `BTreeMap<String, Quantity>` resource lists
/// and in the quantity-typed fields of a VirtualMachineInstance.
///
/// # Errors
/// The parser fails on malformed numbers, unknown unit suffixes or values that do not fit in i64.
pub trait QuantityParser {
    /// The value in thousandths of the unit (millicores for cpu), rounded up.
    ///
    /// ```rust
    /// # use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    /// # use vmi_mutator::quantity_parser::QuantityParser;
    /// #
    /// assert_eq!(Quantity("2200m".into()).to_millis().unwrap(), 2200);
    /// assert_eq!(Quantity("2.3".into()).to_millis().unwrap(), 2300);
    /// ```
    fn to_millis(&self) -> Result<i64, ParseError>;

    /// The value in whole units (bytes for memory, cores for cpu), rounded up.
    ///
    /// ```rust
    /// # use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    /// # use vmi_mutator::quantity_parser::QuantityParser;
    /// #
    /// let mib = Quantity("1Mi".into());
    /// assert_eq!(mib.to_value().unwrap(), 1048576);
    /// assert_eq!(Quantity("2200m".into()).to_value().unwrap(), 3);
    /// ```
    fn to_value(&self) -> Result<i64, ParseError>;

    /// The notation the quantity is written in.
    fn format(&self) -> Result<QuantityFormat, ParseError>;
}

impl QuantityParser for Quantity {
    fn to_millis(&self) -> Result<i64, ParseError> {
        let millis = parse(&self.0)?.millis()?;
        i64::try_from(millis).map_err(|_| ParseError::OutOfRange)
    }

    fn to_value(&self) -> Result<i64, ParseError> {
        let millis = parse(&self.0)?.millis()?;
        let value = if millis >= 0 {
            div_ceil(millis, 1000)
        } else {
            -((-millis) / 1000)
        };
        i64::try_from(value).map_err(|_| ParseError::OutOfRange)
    }

    fn format(&self) -> Result<QuantityFormat, ParseError> {
        Ok(parse(&self.0)?.format)
    }
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ei", 6),
    ("Pi", 5),
    ("Ti", 4),
    ("Gi", 3),
    ("Mi", 2),
    ("Ki", 1),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
];

/// Render a whole-unit value in its canonical form for the given notation, choosing the largest
/// suffix that represents the value exactly.
pub fn format_quantity(value: i64, format: QuantityFormat) -> Quantity {
    if value == 0 {
        return Quantity("0".into());
    }

    if format == QuantityFormat::BinarySI && value.unsigned_abs() >= 1024 {
        for (suffix, power) in BINARY_SUFFIXES {
            let divisor = 1024i64.pow(power);
            if value % divisor == 0 {
                return Quantity(format!("{}{suffix}", value / divisor));
            }
        }
    }

    for (suffix, exponent) in DECIMAL_SUFFIXES {
        let divisor = 10i64.pow(exponent);
        if value % divisor == 0 {
            return match format {
                QuantityFormat::DecimalExponent => {
                    Quantity(format!("{}e{exponent}", value / divisor))
                }
                _ => Quantity(format!("{}{suffix}", value / divisor)),
            };
        }
    }

    Quantity(value.to_string())
}
