//! Symbolic front end for a DSL describing biophysical ODE models.
//!
//! A model is a two-level namespace of components and variables, each
//! variable defined by an immutable expression tree. On top of that the
//! crate provides unit checking (tolerant and strict), symbolic
//! differentiation, numerical evaluation with rich diagnostics, and
//! whole-model validation.
//!
//! ```
//! let source = "
//! [[model]]
//! name: decay
//! cell.x = 0.1
//!
//! [cell]
//! t = 0
//!     bind time
//! k = 2
//! dot(x) = -k * x
//! ";
//! let model = cellsl::parse_model(source).unwrap();
//! assert!(cellsl::validate(&model).unwrap().is_empty());
//! assert_eq!(model.states().len(), 1);
//! ```

pub mod error;
pub mod expr;
pub mod model;
pub mod parser;
pub mod units;
pub mod utils;
pub mod validate;

pub use error::{EvalError, IntegrityError, ParseError, UnitError, Warning};
pub use expr::{
    diff, DiffTarget, ExprKind, Expression, Func, InfixOp, Precision, PrefixOp, Ref,
};
pub use model::{CompId, Model, Scope, VarId, VarKind};
pub use parser::{parse_expression, parse_model};
pub use units::{Unit, UnitMode, UnitRegistry};
pub use validate::{prune_unused, validate};
