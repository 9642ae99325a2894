//! Physical units as an exponent vector over the seven SI base dimensions
//! plus a multiplicative scale factor, with tolerant/strict combination
//! modes and an explicit (never global) name registry.

use std::collections::HashMap;
use std::fmt;

use approx::abs_diff_eq;

use crate::error::UnitError;
use crate::utils::format_float;

/// Number of base dimensions: length, mass, time, current, temperature,
/// amount, luminous intensity.
pub const DIMENSIONS: usize = 7;

const BASE_NAMES: [&str; DIMENSIONS] = ["m", "kg", "s", "A", "K", "mol", "cd"];

/// Tolerance used when comparing exponents and multipliers.
const TOL: f64 = 1e-9;

/// How an unspecified unit (`None`) combines with a known unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitMode {
    /// `None` is absorbed: `None + [kg]` behaves as `[kg] + [kg]`,
    /// `None * [m]` as `[1] * [m]`, `None * None` stays `None`.
    Tolerant,
    /// `None` is treated as dimensionless; every mismatch is an error and
    /// propagation always produces a fully specified unit.
    Strict,
}

/// A physical unit: base-dimension exponents plus a scale factor stored as
/// its base-10 logarithm (so `mV` is volt with `log10_mult = -3`).
#[derive(Debug, Clone, Copy)]
pub struct Unit {
    exps: [f64; DIMENSIONS],
    log10_mult: f64,
}

impl Unit {
    pub fn new(exps: [f64; DIMENSIONS], multiplier: f64) -> Self {
        Self {
            exps,
            log10_mult: multiplier.log10(),
        }
    }

    pub fn dimensionless() -> Self {
        Self {
            exps: [0.0; DIMENSIONS],
            log10_mult: 0.0,
        }
    }

    /// The base unit for a single dimension index (0 = m, 1 = kg, ...).
    pub fn base(dimension: usize) -> Self {
        let mut exps = [0.0; DIMENSIONS];
        exps[dimension] = 1.0;
        Self {
            exps,
            log10_mult: 0.0,
        }
    }

    pub fn exponents(&self) -> &[f64; DIMENSIONS] {
        &self.exps
    }

    pub fn multiplier(&self) -> f64 {
        10f64.powf(self.log10_mult)
    }

    pub fn is_dimensionless(&self) -> bool {
        self.exps.iter().all(|e| abs_diff_eq!(*e, 0.0, epsilon = TOL))
            && abs_diff_eq!(self.log10_mult, 0.0, epsilon = TOL)
    }

    /// True if the exponent vectors are zero, regardless of multiplier.
    pub fn has_no_dimension(&self) -> bool {
        self.exps.iter().all(|e| abs_diff_eq!(*e, 0.0, epsilon = TOL))
    }

    pub fn multiply(&self, other: &Unit) -> Unit {
        let mut exps = self.exps;
        for (e, o) in exps.iter_mut().zip(other.exps.iter()) {
            *e += o;
        }
        Unit {
            exps,
            log10_mult: self.log10_mult + other.log10_mult,
        }
    }

    pub fn divide(&self, other: &Unit) -> Unit {
        let mut exps = self.exps;
        for (e, o) in exps.iter_mut().zip(other.exps.iter()) {
            *e -= o;
        }
        Unit {
            exps,
            log10_mult: self.log10_mult - other.log10_mult,
        }
    }

    /// Raises the unit to a (possibly rational) power; the multiplier is
    /// raised correspondingly.
    pub fn power(&self, exponent: f64) -> Unit {
        let mut exps = self.exps;
        for e in exps.iter_mut() {
            *e *= exponent;
        }
        Unit {
            exps,
            log10_mult: self.log10_mult * exponent,
        }
    }

    pub fn scaled(&self, factor: f64) -> Unit {
        Unit {
            exps: self.exps,
            log10_mult: self.log10_mult + factor.log10(),
        }
    }

    /// Canonical rendering in terms of base units, e.g.
    /// `kg*m^2*s^-3*A^-1 (1e-3)`. Parses back to an equal unit.
    pub fn code(&self) -> String {
        let mut parts = Vec::new();
        for (i, &e) in self.exps.iter().enumerate() {
            if abs_diff_eq!(e, 0.0, epsilon = TOL) {
                continue;
            }
            if abs_diff_eq!(e, 1.0, epsilon = TOL) {
                parts.push(BASE_NAMES[i].to_string());
            } else if abs_diff_eq!(e, e.round(), epsilon = TOL) {
                parts.push(format!("{}^{}", BASE_NAMES[i], e.round() as i64));
            } else {
                parts.push(format!("{}^{}", BASE_NAMES[i], e));
            }
        }
        let mut out = if parts.is_empty() {
            "1".to_string()
        } else {
            parts.join("*")
        };
        if !abs_diff_eq!(self.log10_mult, 0.0, epsilon = TOL) {
            out.push_str(&format!(" ({})", format_float(self.multiplier())));
        }
        out
    }

    /// Quantized key for registry reverse lookup.
    fn key(&self) -> UnitKey {
        let mut exps = [0i64; DIMENSIONS];
        for (k, e) in exps.iter_mut().zip(self.exps.iter()) {
            *k = (e * 1e6).round() as i64;
        }
        (exps, (self.log10_mult * 1e6).round() as i64)
    }
}

type UnitKey = ([i64; DIMENSIONS], i64);

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.exps
            .iter()
            .zip(other.exps.iter())
            .all(|(a, b)| abs_diff_eq!(*a, *b, epsilon = TOL))
            && abs_diff_eq!(self.log10_mult, other.log10_mult, epsilon = TOL)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Combines two optional units for addition-like operators (`+`, `-`,
/// comparisons, branch agreement) under the given mode.
pub fn combine_equal(
    a: &Option<Unit>,
    b: &Option<Unit>,
    mode: UnitMode,
    context: &str,
) -> Result<Option<Unit>, UnitError> {
    match mode {
        UnitMode::Tolerant => match (a, b) {
            (None, None) => Ok(None),
            (Some(u), None) | (None, Some(u)) => Ok(Some(*u)),
            (Some(u), Some(v)) => {
                if u == v {
                    Ok(Some(*u))
                } else {
                    Err(mismatch(u, v, context))
                }
            }
        },
        UnitMode::Strict => {
            let u = a.unwrap_or_else(Unit::dimensionless);
            let v = b.unwrap_or_else(Unit::dimensionless);
            if u == v {
                Ok(Some(u))
            } else {
                Err(mismatch(&u, &v, context))
            }
        }
    }
}

/// Combines two optional units multiplicatively (`*` adds exponents,
/// `/` subtracts). In tolerant mode `None * None` stays `None` and a lone
/// `None` behaves as dimensionless.
pub fn combine_product(
    a: &Option<Unit>,
    b: &Option<Unit>,
    divide: bool,
    mode: UnitMode,
) -> Option<Unit> {
    let (a, b) = match mode {
        UnitMode::Tolerant => {
            if a.is_none() && b.is_none() {
                return None;
            }
            (
                a.unwrap_or_else(Unit::dimensionless),
                b.unwrap_or_else(Unit::dimensionless),
            )
        }
        UnitMode::Strict => (
            a.unwrap_or_else(Unit::dimensionless),
            b.unwrap_or_else(Unit::dimensionless),
        ),
    };
    Some(if divide { a.divide(&b) } else { a.multiply(&b) })
}

fn mismatch(a: &Unit, b: &Unit, context: &str) -> UnitError {
    UnitError::new(format!("[{}] does not match [{}] in {}", a, b, context))
}

/// Explicit unit name table, constructed once (typically per Model) and
/// passed through calls; never ambient process state.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    names: HashMap<String, Unit>,
    reverse: HashMap<UnitKey, String>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::si()
    }
}

impl UnitRegistry {
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Registry preloaded with the SI base units, common derived units and
    /// SI-prefixed forms of the prefixable ones.
    pub fn si() -> Self {
        let mut reg = Self::empty();
        let m = Unit::base(0);
        let kg = Unit::base(1);
        let s = Unit::base(2);
        let ampere = Unit::base(3);
        let kelvin = Unit::base(4);
        let mol = Unit::base(5);
        let cd = Unit::base(6);
        let g = kg.scaled(1e-3);

        let hz = Unit::dimensionless().divide(&s);
        let newton = kg.multiply(&m).divide(&s.power(2.0));
        let pa = newton.divide(&m.power(2.0));
        let joule = newton.multiply(&m);
        let watt = joule.divide(&s);
        let coulomb = ampere.multiply(&s);
        let volt = watt.divide(&ampere);
        let farad = coulomb.divide(&volt);
        let siemens = ampere.divide(&volt);
        let ohm = volt.divide(&ampere);
        let weber = volt.multiply(&s);
        let tesla = weber.divide(&m.power(2.0));
        let henry = weber.divide(&ampere);
        let liter = m.power(3.0).scaled(1e-3);
        let molar = mol.divide(&liter);

        let named: &[(&str, Unit)] = &[
            ("m", m),
            ("kg", kg),
            ("g", g),
            ("s", s),
            ("A", ampere),
            ("K", kelvin),
            ("mol", mol),
            ("cd", cd),
            ("Hz", hz),
            ("N", newton),
            ("Pa", pa),
            ("J", joule),
            ("W", watt),
            ("C", coulomb),
            ("V", volt),
            ("F", farad),
            ("S", siemens),
            ("ohm", ohm),
            ("Wb", weber),
            ("T", tesla),
            ("H", henry),
            ("L", liter),
            ("M", molar),
        ];
        for (name, unit) in named {
            reg.register(name, *unit);
        }

        const PREFIXES: &[(&str, f64)] = &[
            ("y", 1e-24),
            ("z", 1e-21),
            ("a", 1e-18),
            ("f", 1e-15),
            ("p", 1e-12),
            ("n", 1e-9),
            ("u", 1e-6),
            ("m", 1e-3),
            ("c", 1e-2),
            ("d", 1e-1),
            ("da", 1e1),
            ("h", 1e2),
            ("k", 1e3),
            ("M", 1e6),
            ("G", 1e9),
            ("T", 1e12),
            ("P", 1e15),
            ("E", 1e18),
        ];
        const PREFIXABLE: &[&str] = &[
            "m", "g", "s", "A", "K", "mol", "Hz", "N", "Pa", "J", "W", "C", "V", "F", "S",
            "ohm", "Wb", "T", "H", "L", "M",
        ];
        for base in PREFIXABLE {
            let unit = reg.names[*base];
            for (prefix, factor) in PREFIXES {
                let name = format!("{prefix}{base}");
                if !reg.names.contains_key(&name) {
                    reg.register(&name, unit.scaled(*factor));
                }
            }
        }
        reg
    }

    /// Registers a name; the first name registered for a given unit wins
    /// reverse lookup.
    pub fn register(&mut self, name: &str, unit: Unit) {
        self.reverse.entry(unit.key()).or_insert_with(|| name.to_string());
        self.names.insert(name.to_string(), unit);
    }

    pub fn lookup(&self, name: &str) -> Option<Unit> {
        self.names.get(name).copied()
    }

    /// Preferred rendering: a registered name if one matches exactly, the
    /// canonical base-unit form otherwise.
    pub fn format(&self, unit: &Unit) -> String {
        match self.reverse.get(&unit.key()) {
            Some(name) => name.clone(),
            None => unit.code(),
        }
    }

    /// Parses a bracket-literal unit expression (without the brackets):
    /// `name`, `1`, products and quotients with `*` and `/`, `^` with a
    /// possibly signed, possibly fractional exponent, and an optional
    /// trailing parenthesized multiplier: `kg*m/s^2 (1e-3)`.
    pub fn parse(&self, text: &str) -> Result<Unit, UnitError> {
        let mut scanner = UnitScanner::new(text);
        let mut unit = self.parse_term(&mut scanner)?;
        loop {
            match scanner.peek() {
                Some('*') => {
                    scanner.next();
                    let rhs = self.parse_term(&mut scanner)?;
                    unit = unit.multiply(&rhs);
                }
                Some('/') => {
                    scanner.next();
                    let rhs = self.parse_term(&mut scanner)?;
                    unit = unit.divide(&rhs);
                }
                Some('(') => {
                    scanner.next();
                    let number = scanner.take_number()?;
                    if scanner.next() != Some(')') {
                        return Err(UnitError::new(format!(
                            "expected ')' after multiplier in '{text}'"
                        )));
                    }
                    unit = unit.scaled(number);
                }
                None => break,
                Some(c) => {
                    return Err(UnitError::new(format!(
                        "unexpected '{c}' in unit '{text}'"
                    )))
                }
            }
        }
        Ok(unit)
    }

    fn parse_term(&self, scanner: &mut UnitScanner) -> Result<Unit, UnitError> {
        let mut unit = match scanner.peek() {
            Some('1') => {
                scanner.next();
                Unit::dimensionless()
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let name = scanner.take_name();
                self.lookup(&name)
                    .ok_or_else(|| UnitError::new(format!("unknown unit '{name}'")))?
            }
            other => {
                return Err(UnitError::new(format!(
                    "expected unit name, found {:?}",
                    other
                )))
            }
        };
        if scanner.peek() == Some('^') {
            scanner.next();
            let exponent = scanner.take_number()?;
            unit = unit.power(exponent);
        }
        Ok(unit)
    }
}

/// Minimal character scanner for unit literals.
struct UnitScanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> UnitScanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn skip_space(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_space();
        self.chars.peek().copied()
    }

    fn next(&mut self) -> Option<char> {
        self.skip_space();
        self.chars.next()
    }

    fn take_name(&mut self) -> String {
        self.skip_space();
        let mut name = String::new();
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
            name.push(self.chars.next().unwrap());
        }
        name
    }

    fn take_number(&mut self) -> Result<f64, UnitError> {
        self.skip_space();
        let mut text = String::new();
        if matches!(self.chars.peek(), Some('-') | Some('+')) {
            text.push(self.chars.next().unwrap());
        }
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit() || *c == '.') {
            text.push(self.chars.next().unwrap());
        }
        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            text.push(self.chars.next().unwrap());
            if matches!(self.chars.peek(), Some('-') | Some('+')) {
                text.push(self.chars.next().unwrap());
            }
            while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                text.push(self.chars.next().unwrap());
            }
        }
        text.parse()
            .map_err(|_| UnitError::new(format!("invalid number '{text}' in unit")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_form_a_group_under_multiplication() {
        let reg = UnitRegistry::si();
        let n = reg.lookup("N").unwrap();
        let m = reg.lookup("m").unwrap();
        let j = reg.lookup("J").unwrap();
        assert_eq!(n.multiply(&m), j);
        assert_eq!(j.divide(&m), n);
        assert!(j.divide(&j).is_dimensionless());
    }

    #[test]
    fn rational_powers_scale_the_multiplier() {
        let reg = UnitRegistry::si();
        let cm2 = reg.lookup("cm").unwrap().power(2.0);
        assert!(abs_diff_eq!(cm2.multiplier(), 1e-4, epsilon = 1e-12));
        let back = cm2.power(0.5);
        assert_eq!(back, reg.lookup("cm").unwrap());
    }

    #[test]
    fn prefixed_names_resolve() {
        let reg = UnitRegistry::si();
        let mv = reg.lookup("mV").unwrap();
        assert_eq!(mv, reg.lookup("V").unwrap().scaled(1e-3));
        assert_eq!(reg.format(&mv), "mV");
    }

    #[test]
    fn parse_compound_literals() {
        let reg = UnitRegistry::si();
        let parsed = reg.parse("kg*m/s^2 (1e-3)").unwrap();
        assert_eq!(parsed, reg.lookup("N").unwrap().scaled(1e-3));
        assert_eq!(reg.parse("1").unwrap(), Unit::dimensionless());
        assert_eq!(reg.parse("m^0.5").unwrap(), reg.lookup("m").unwrap().power(0.5));
        assert!(reg.parse("furlong").is_err());
    }

    #[test]
    fn canonical_code_round_trips() {
        let reg = UnitRegistry::si();
        for name in ["mV", "J", "uA", "M", "Hz"] {
            let unit = reg.lookup(name).unwrap();
            assert_eq!(reg.parse(&unit.code()).unwrap(), unit, "{name}");
        }
    }

    #[test]
    fn tolerant_absorbs_none_strict_does_not() {
        let reg = UnitRegistry::si();
        let kg = Some(reg.lookup("kg").unwrap());
        assert_eq!(
            combine_equal(&None, &kg, UnitMode::Tolerant, "+").unwrap(),
            kg
        );
        assert!(combine_equal(&None, &kg, UnitMode::Strict, "+").is_err());
        assert_eq!(combine_product(&None, &None, false, UnitMode::Tolerant), None);
        assert_eq!(
            combine_product(&None, &kg, false, UnitMode::Tolerant).unwrap(),
            kg.unwrap()
        );
        assert!(
            combine_product(&None, &None, false, UnitMode::Strict)
                .unwrap()
                .is_dimensionless()
        );
    }
}
