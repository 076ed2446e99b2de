//! Physical quantities used by the DAQ: volts, amps, seconds, ohms and raw codes.
//!
//! [`Quantity`] is a small closed value type. Every quantity is stored in the
//! base unit of its dimension, so SI prefixes only exist at the text boundary
//! (parsing with [`Quantity::from_str`], formatting with [`Quantity::value_in`]).
//!
//! Mixing dimensions is an error rather than a silent mistake:
//!
//! ```
//! use pftl_daq::units::{Quantity, Unit};
//!
//! let v: Quantity = "1.5V".parse().unwrap();
//! let r: Quantity = "1kOhm".parse().unwrap();
//! let i = v.checked_div(&r).unwrap();
//! assert_eq!(i.unit(), Unit::Amp);
//! assert!((i.value_in("mA").unwrap() - 1.5).abs() < 1e-12);
//! assert!(v.checked_add(&r).is_err());
//! ```
//!
//! [`Converter`] holds the fixed calibration between device codes and volts.

use crate::error::{DaqError, DaqResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Mul, Neg};
use std::str::FromStr;
use std::time::Duration;

/// Unit of a [`Quantity`]. Each unit is its own dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Volt
    Volt,
    /// Ampere
    Amp,
    /// Second
    Second,
    /// Ohm
    Ohm,
    /// Dimensionless converter code (DAC/ADC count)
    Code,
}

impl Unit {
    /// Symbol used when formatting and parsing.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Amp => "A",
            Unit::Second => "s",
            Unit::Ohm => "Ohm",
            Unit::Code => "",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "V" => Some(Unit::Volt),
            "A" => Some(Unit::Amp),
            "s" => Some(Unit::Second),
            "Ohm" | "ohm" | "Ω" => Some(Unit::Ohm),
            "" | "code" => Some(Unit::Code),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Code => f.write_str("code"),
            other => f.write_str(other.symbol()),
        }
    }
}

fn prefix_factor(prefix: char) -> Option<f64> {
    match prefix {
        'p' => Some(1e-12),
        'n' => Some(1e-9),
        'u' | 'µ' => Some(1e-6),
        'm' => Some(1e-3),
        'k' => Some(1e3),
        'M' => Some(1e6),
        _ => None,
    }
}

/// Split a unit suffix such as `mA` or `kOhm` into its scale factor and base unit.
fn parse_unit_suffix(suffix: &str) -> Option<(f64, Unit)> {
    if let Some(unit) = Unit::from_symbol(suffix) {
        return Some((1.0, unit));
    }
    let mut chars = suffix.chars();
    let prefix = chars.next()?;
    let factor = prefix_factor(prefix)?;
    match Unit::from_symbol(chars.as_str())? {
        Unit::Code => None,
        unit => Some((factor, unit)),
    }
}

/// A magnitude tagged with a [`Unit`], stored in the unit's base scale.
///
/// Quantities are immutable; every operation returns a new value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    magnitude: f64,
    unit: Unit,
}

impl Quantity {
    /// Create a quantity from a magnitude in the unit's base scale.
    pub const fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    /// Shorthand for a voltage.
    pub const fn volts(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::Volt)
    }

    /// Shorthand for a current.
    pub const fn amps(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::Amp)
    }

    /// Shorthand for a duration in seconds.
    pub const fn seconds(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::Second)
    }

    /// Shorthand for a resistance.
    pub const fn ohms(magnitude: f64) -> Self {
        Self::new(magnitude, Unit::Ohm)
    }

    /// Magnitude in the base scale of [`Quantity::unit`].
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Unit of this quantity.
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Convert to `unit`, failing when the dimensions differ.
    pub fn to(&self, unit: Unit) -> DaqResult<Quantity> {
        self.ensure_unit(unit)?;
        Ok(*self)
    }

    /// Magnitude expressed in a prefixed unit such as `"mA"` or `"ms"`.
    pub fn value_in(&self, unit: &str) -> DaqResult<f64> {
        let (factor, target) =
            parse_unit_suffix(unit.trim()).ok_or_else(|| DaqError::Parse(unit.to_string()))?;
        self.ensure_unit(target)?;
        Ok(self.magnitude / factor)
    }

    /// Interpret a quantity of seconds as a [`Duration`].
    pub fn as_duration(&self) -> DaqResult<Duration> {
        self.ensure_unit(Unit::Second)?;
        Duration::try_from_secs_f64(self.magnitude).map_err(|_| DaqError::Parse(self.to_string()))
    }

    /// Sum of two quantities of the same unit.
    pub fn checked_add(&self, other: &Quantity) -> DaqResult<Quantity> {
        other.ensure_unit(self.unit)?;
        Ok(Quantity::new(self.magnitude + other.magnitude, self.unit))
    }

    /// Difference of two quantities of the same unit.
    pub fn checked_sub(&self, other: &Quantity) -> DaqResult<Quantity> {
        other.ensure_unit(self.unit)?;
        Ok(Quantity::new(self.magnitude - other.magnitude, self.unit))
    }

    /// Product, restricted to the unit combinations used by the DAQ.
    ///
    /// `A * Ohm = V`, and any unit times a `Code` keeps its unit.
    pub fn checked_mul(&self, other: &Quantity) -> DaqResult<Quantity> {
        let unit = match (self.unit, other.unit) {
            (Unit::Amp, Unit::Ohm) | (Unit::Ohm, Unit::Amp) => Unit::Volt,
            (unit, Unit::Code) | (Unit::Code, unit) => unit,
            (from, to) => return Err(DaqError::IncompatibleUnit { from, to }),
        };
        Ok(Quantity::new(self.magnitude * other.magnitude, unit))
    }

    /// Quotient, restricted to the unit combinations used by the DAQ.
    ///
    /// `V / Ohm = A`, `V / A = Ohm`, equal units give a `Code` ratio and
    /// dividing by a `Code` keeps the unit.
    pub fn checked_div(&self, other: &Quantity) -> DaqResult<Quantity> {
        let unit = match (self.unit, other.unit) {
            (Unit::Volt, Unit::Ohm) => Unit::Amp,
            (Unit::Volt, Unit::Amp) => Unit::Ohm,
            (unit, Unit::Code) => unit,
            (a, b) if a == b => Unit::Code,
            (from, to) => return Err(DaqError::IncompatibleUnit { from, to }),
        };
        Ok(Quantity::new(self.magnitude / other.magnitude, unit))
    }

    fn ensure_unit(&self, unit: Unit) -> DaqResult<()> {
        if self.unit == unit {
            Ok(())
        } else {
            Err(DaqError::IncompatibleUnit {
                from: self.unit,
                to: unit,
            })
        }
    }
}

impl Mul<f64> for Quantity {
    type Output = Quantity;

    fn mul(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude * rhs, self.unit)
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity::new(-self.magnitude, self.unit)
    }
}

/// Quantities of different units have no ordering.
impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.unit != other.unit {
            return None;
        }
        self.magnitude.partial_cmp(&other.magnitude)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.symbol())
    }
}

impl FromStr for Quantity {
    type Err = DaqError;

    /// Parse `"<number><unit-suffix>"`, e.g. `"3000mV"`, `"1e-3 A"`, `"10ms"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        // Longest prefix that is a number; the rest is the unit suffix.
        let split = text
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .rev()
            .find(|&end| text[..end].trim_end().parse::<f64>().is_ok())
            .ok_or_else(|| DaqError::Parse(s.to_string()))?;

        let magnitude: f64 = text[..split]
            .trim_end()
            .parse()
            .map_err(|_| DaqError::Parse(s.to_string()))?;
        if !magnitude.is_finite() {
            return Err(DaqError::Parse(s.to_string()));
        }
        let (factor, unit) =
            parse_unit_suffix(text[split..].trim()).ok_or_else(|| DaqError::Parse(s.to_string()))?;

        Ok(Quantity::new(magnitude * factor, unit))
    }
}

impl TryFrom<String> for Quantity {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quantity> for String {
    fn from(value: Quantity) -> Self {
        value.to_string()
    }
}

/// Linear calibration between device codes and volts for one converter.
///
/// The device carries two converters with different resolutions against the
/// same 3.3 V reference, so output and input scales are deliberately distinct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Converter {
    /// Largest code the converter produces or accepts.
    pub max_code: i64,
    /// Voltage corresponding to `max_code`.
    pub full_scale_volts: f64,
}

impl Converter {
    /// 12-bit analog output (DAC): codes 0-4095 over 0-3.3 V.
    pub const OUTPUT: Converter = Converter {
        max_code: 4095,
        full_scale_volts: 3.3,
    };

    /// 10-bit analog input (ADC): codes 0-1023 over 0-3.3 V.
    pub const INPUT: Converter = Converter {
        max_code: 1023,
        full_scale_volts: 3.3,
    };

    /// Voltage represented by `code`.
    pub fn code_to_volts(&self, code: i64) -> Quantity {
        Quantity::volts(code as f64 * self.full_scale_volts / self.max_code as f64)
    }

    /// Nearest code for `volts`. Codes outside the converter range are passed on
    /// unchanged so the device can reject them.
    pub fn volts_to_code(&self, volts: &Quantity) -> DaqResult<i64> {
        let volts = volts.to(Unit::Volt)?.magnitude();
        let code = (volts / self.full_scale_volts * self.max_code as f64).round() as i64;
        if !(0..=self.max_code).contains(&code) {
            warn!(
                "{} V maps to code {} outside 0-{}",
                volts, code, self.max_code
            );
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_prefixed_units() {
        assert_eq!(q("3000mV"), Quantity::volts(3.0));
        assert_eq!(q("1kOhm"), Quantity::ohms(1000.0));
        assert_eq!(q("10 ms").unit(), Unit::Second);
        assert!((q("10 ms").magnitude() - 0.01).abs() < 1e-15);
        assert_eq!(q("1e-3A"), Quantity::amps(1e-3));
        assert_eq!(q("-0.5V"), Quantity::volts(-0.5));
        assert_eq!(q("42"), Quantity::new(42.0, Unit::Code));
        assert_eq!(q("2.2Ω"), Quantity::ohms(2.2));
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in ["", "V", "abc", "1.2.3V", "5 furlongs", "3xV", "nanV", "1mcode"] {
            assert!(
                matches!(bad.parse::<Quantity>(), Err(DaqError::Parse(_))),
                "'{}' should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_conversion_between_dimensions_fails() {
        let v = Quantity::volts(1.0);
        assert!(v.to(Unit::Volt).is_ok());
        assert!(matches!(
            v.to(Unit::Amp),
            Err(DaqError::IncompatibleUnit {
                from: Unit::Volt,
                to: Unit::Amp
            })
        ));
        assert!(v.value_in("ms").is_err());
        assert_eq!(Quantity::amps(0.002).value_in("mA").unwrap(), 2.0);
    }

    #[test]
    fn test_arithmetic_respects_dimensions() {
        let sum = Quantity::volts(1.0).checked_add(&Quantity::volts(0.5)).unwrap();
        assert_eq!(sum, Quantity::volts(1.5));
        assert!(Quantity::volts(1.0).checked_sub(&Quantity::seconds(1.0)).is_err());

        let current = Quantity::volts(2.0).checked_div(&Quantity::ohms(1000.0)).unwrap();
        assert_eq!(current, Quantity::amps(0.002));
        let back = current.checked_mul(&Quantity::ohms(1000.0)).unwrap();
        assert_eq!(back.unit(), Unit::Volt);
        assert!(Quantity::seconds(1.0).checked_div(&Quantity::ohms(1.0)).is_err());
        assert_eq!(Quantity::volts(3.0) * 2.0, Quantity::volts(6.0));
    }

    #[test]
    fn test_comparison_requires_same_unit() {
        assert!(Quantity::volts(1.0) < Quantity::volts(2.0));
        assert_eq!(Quantity::volts(1.0).partial_cmp(&Quantity::amps(2.0)), None);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let yaml = serde_yaml::to_string(&Quantity::volts(0.5)).unwrap();
        assert_eq!(yaml.trim(), "0.5V");
        let parsed: Quantity = serde_yaml::from_str("'10ms'").unwrap();
        let delay = parsed.as_duration().unwrap();
        assert!((delay.as_secs_f64() - 0.01).abs() < 1e-9);
        assert!(Quantity::seconds(-1.0).as_duration().is_err());
    }

    #[test]
    fn test_code_round_trip_within_one_lsb() {
        for converter in [Converter::OUTPUT, Converter::INPUT] {
            for code in 0..=converter.max_code {
                let volts = converter.code_to_volts(code);
                let back = converter.volts_to_code(&volts).unwrap();
                assert!((back - code).abs() <= 1, "code {} came back as {}", code, back);
            }
        }
    }

    #[test]
    fn test_converter_scales_stay_distinct() {
        let full = Quantity::volts(3.3);
        assert_eq!(Converter::OUTPUT.volts_to_code(&full).unwrap(), 4095);
        assert_eq!(Converter::INPUT.volts_to_code(&full).unwrap(), 1023);
        assert!(Converter::OUTPUT.volts_to_code(&Quantity::amps(1.0)).is_err());
    }
}
