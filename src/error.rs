//! Error types for parsing, model integrity, unit checking and evaluation.
//!
//! Parse and integrity failures are fatal and fail fast; unit failures are
//! raised only when a unit check is requested; evaluation failures are
//! value-level rich diagnostics that never leak a raw arithmetic fault.

use std::fmt;

use thiserror::Error;

use crate::utils::format_float;

/// A failure while tokenizing or parsing DSL text.
///
/// Carries a short error-name, a 1-based line, a 0-based column, a detail
/// message and an optional nested integrity cause (e.g. a bad function
/// arity discovered while constructing the node the parser asked for).
#[derive(Debug, Clone, Error)]
pub struct ParseError {
    pub name: String,
    pub line: usize,
    pub col: usize,
    pub detail: String,
    /// Length of the offending span, used for underlining.
    pub span: usize,
    pub cause: Option<Box<IntegrityError>>,
}

impl ParseError {
    pub fn new(
        name: impl Into<String>,
        line: usize,
        col: usize,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            line,
            col,
            detail: detail.into(),
            span: 1,
            cause: None,
        }
    }

    pub fn with_span(mut self, span: usize) -> Self {
        self.span = span.max(1);
        self
    }

    pub fn with_cause(mut self, cause: IntegrityError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Formats the error interleaved with the offending source line, with a
    /// `~~~` underline below the failing span.
    pub fn pretty(&self, source: &str) -> String {
        let mut out = format!("{self}");
        if let Some(line_text) = source.lines().nth(self.line.saturating_sub(1)) {
            let width = self.span.min(line_text.chars().count().saturating_sub(self.col)).max(1);
            out.push_str(&format!(
                "\n  {}\n  {}{}",
                line_text,
                " ".repeat(self.col),
                "~".repeat(width)
            ));
        }
        if let Some(cause) = &self.cause {
            out.push_str(&format!("\ncaused by: {cause}"));
        }
        out
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on line {}, character {}: {}",
            self.name, self.line, self.col, self.detail
        )
    }
}

/// A structural failure in a parsed or host-API-modified model.
#[derive(Debug, Clone, Error)]
pub enum IntegrityError {
    #[error("cyclic dependency: {path}")]
    CyclicDependency { path: String },

    #[error("illegal reference to '{reference}' from '{scope}': not visible from this scope")]
    IllegalReference { reference: String, scope: String },

    #[error("duplicate name '{name}'")]
    DuplicateName { name: String },

    #[error("invalid name '{name}': {detail}")]
    InvalidName { name: String, detail: String },

    #[error("variable '{variable}' has no defining equation")]
    MissingRhs { variable: String },

    #[error("state variable '{variable}' has no initial value")]
    MissingInitialValue { variable: String },

    #[error("invalid binding '{label}': {detail}")]
    InvalidBinding { label: String, detail: String },

    #[error("{function}() cannot be called with {got} argument(s)")]
    BadArity { function: String, got: usize },

    #[error("cannot remove '{variable}': still referenced by {referrer}")]
    VariableInUse { variable: String, referrer: String },

    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("unknown component '{name}'")]
    UnknownComponent { name: String },

    #[error("'{variable}' is not a state variable")]
    NotAState { variable: String },

    #[error("'{variable}' is already a state variable")]
    AlreadyAState { variable: String },

    #[error("cannot differentiate: {detail}")]
    CannotDifferentiate { detail: String },
}

/// An incompatible-unit failure from dimensional analysis.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("incompatible units: {message}")]
pub struct UnitError {
    pub message: String,
}

impl UnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A numerical failure during evaluation, wrapped with a full diagnostic
/// trail: the failing sub-expression, the values of its immediate operands
/// and every transitively referenced variable's value or equation.
#[derive(Debug, Clone, Error)]
pub struct EvalError {
    pub message: String,
    /// DSL code of the sub-expression that failed.
    pub expression: String,
    /// Immediate operands of the failing node, as (code, value) pairs.
    pub operands: Vec<(String, f64)>,
    /// One line per transitively referenced variable: its value or equation.
    pub trail: Vec<String>,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "numerical error: {}", self.message)?;
        writeln!(f, "  in: {}", self.expression)?;
        for (code, value) in &self.operands {
            writeln!(f, "  operand {} = {}", code, format_float(*value))?;
        }
        for line in &self.trail {
            writeln!(f, "  where {line}")?;
        }
        Ok(())
    }
}

/// A recoverable finding from validation; reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    UnusedVariable { variable: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnusedVariable { variable } => {
                write!(f, "unused variable '{variable}'")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_underlines_the_failing_span() {
        let source = "x = 5 * yy\n";
        let err = ParseError::new("Unresolved reference", 1, 8, "unknown variable 'yy'")
            .with_span(2);
        let pretty = err.pretty(source);
        assert!(pretty.contains("line 1, character 8"));
        assert!(pretty.contains("x = 5 * yy"));
        assert!(pretty.ends_with("        ~~"));
    }

    #[test]
    fn parse_error_reports_nested_cause() {
        let err = ParseError::new("Integrity error", 3, 0, "bad call").with_cause(
            IntegrityError::BadArity {
                function: "sqrt".into(),
                got: 2,
            },
        );
        assert!(err.pretty("a\nb\nsqrt(1, 2)").contains("caused by"));
    }
}
