//! Symbolic differentiation.
//!
//! Derivatives are taken with respect to a variable or to a state's
//! initial value. Internally "no dependence" is carried as `None` instead
//! of a zero node, so sums and products drop vanishing terms as they are
//! built; the public entry point converts a vanishing result into a zero
//! literal whose unit is `unit(expr) / unit(target)`.
//!
//! Discontinuous constructs follow the one-sided convention: `floor`,
//! `ceil`, `//`, comparisons and boolean operators differentiate to zero,
//! `abs(f)` becomes `if(f >= 0, f', -f')` and `a % b` becomes
//! `a' - b' * floor(a / b)`.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::IntegrityError;
use crate::expr::{DiffTarget, ExprKind, Expression, Func, InfixOp, PrefixOp};
use crate::model::{Model, VarId};
use crate::units::{combine_product, UnitMode};

/// Differentiates `expr` with respect to `target`.
///
/// When `independent_states` is set, states other than the target are
/// treated as independent quantities and their sensitivity vanishes;
/// otherwise a state whose dynamics transitively depend on the target
/// yields an opaque `partial()` node.
///
/// Fails on expressions containing `dot()`, `init()` or `partial()` nodes,
/// and when `target` asks for an initial value of a non-state.
pub fn diff(
    expr: &Rc<Expression>,
    model: &Model,
    target: DiffTarget,
    independent_states: bool,
) -> Result<Rc<Expression>, IntegrityError> {
    if let DiffTarget::Initial(v) = target {
        if !model.var(v).is_state() {
            return Err(IntegrityError::NotAState {
                variable: model.qname(v),
            });
        }
    }
    let mut differ = Differ {
        model,
        target,
        independent_states,
        active: Vec::new(),
        state_memo: HashMap::new(),
    };
    match differ.d(expr)? {
        Some(d) => Ok(d),
        None => Ok(differ.zero_like(expr)),
    }
}

struct Differ<'m> {
    model: &'m Model,
    target: DiffTarget,
    independent_states: bool,
    /// Variables whose defining equations are currently being expanded.
    active: Vec<VarId>,
    /// Per-state result of the transitive dependency trace.
    state_memo: HashMap<VarId, bool>,
}

impl<'m> Differ<'m> {
    /// Core rule dispatch; `Ok(None)` means the derivative vanishes.
    fn d(&mut self, e: &Rc<Expression>) -> Result<Option<Rc<Expression>>, IntegrityError> {
        match e.kind() {
            ExprKind::Number { .. } => Ok(None),
            ExprKind::Name(v) => self.d_name(*v),
            ExprKind::Derivative(_) => Err(IntegrityError::CannotDifferentiate {
                detail: "expression contains a dot() term".into(),
            }),
            ExprKind::Initial(_) => Err(IntegrityError::CannotDifferentiate {
                detail: "expression contains an init() term".into(),
            }),
            ExprKind::Partial { .. } => Err(IntegrityError::CannotDifferentiate {
                detail: "expression contains a partial() term".into(),
            }),
            ExprKind::Prefix(op, child) => match op {
                PrefixOp::Plus => self.d(child),
                PrefixOp::Minus => Ok(self.d(child)?.map(neg)),
                PrefixOp::Not => Ok(None),
            },
            ExprKind::Infix(op, a, b) => {
                if op.is_comparison() || matches!(op, InfixOp::And | InfixOp::Or) {
                    return Ok(None);
                }
                if *op == InfixOp::Quotient {
                    return Ok(None);
                }
                let da = self.d(a)?;
                let db = self.d(b)?;
                match op {
                    InfixOp::Plus => Ok(opt_sum(da, db)),
                    InfixOp::Minus => Ok(match (da, db) {
                        (None, None) => None,
                        (Some(da), None) => Some(da),
                        (None, Some(db)) => Some(neg(db)),
                        (Some(da), Some(db)) => Some(sub(da, db)),
                    }),
                    InfixOp::Multiply => Ok(opt_sum(
                        da.map(|da| mul(da, Rc::clone(b))),
                        db.map(|db| mul(Rc::clone(a), db)),
                    )),
                    InfixOp::Divide => Ok(match (da, db) {
                        (None, None) => None,
                        (Some(da), None) => Some(div(da, Rc::clone(b))),
                        (None, Some(db)) => Some(neg(div(
                            mul(Rc::clone(a), db),
                            square(Rc::clone(b)),
                        ))),
                        (Some(da), Some(db)) => Some(div(
                            sub(mul(da, Rc::clone(b)), mul(Rc::clone(a), db)),
                            square(Rc::clone(b)),
                        )),
                    }),
                    InfixOp::Remainder => {
                        // a % b = a - b * floor(a / b)
                        let db = match db {
                            None => return Ok(da),
                            Some(db) => db,
                        };
                        let steps = Expression::function(
                            Func::Floor,
                            vec![div(Rc::clone(a), Rc::clone(b))],
                        )?;
                        Ok(match da {
                            None => Some(neg(mul(db, steps))),
                            Some(da) => Some(sub(da, mul(db, steps))),
                        })
                    }
                    InfixOp::Power => self.d_power(a, b, da, db),
                    _ => Ok(None),
                }
            }
            ExprKind::Function(f, args) => self.d_function(e, *f, args),
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                let dt = self.d(then)?;
                let de = self.d(otherwise)?;
                if dt.is_none() && de.is_none() {
                    return Ok(None);
                }
                let dt = dt.unwrap_or_else(|| self.zero_like(then));
                let de = de.unwrap_or_else(|| self.zero_like(otherwise));
                Ok(Some(Expression::if_(Rc::clone(cond), dt, de)))
            }
            ExprKind::Piecewise { conditions, exprs } => {
                let ds = exprs
                    .iter()
                    .map(|x| self.d(x))
                    .collect::<Result<Vec<_>, _>>()?;
                if ds.iter().all(Option::is_none) {
                    return Ok(None);
                }
                let padded = exprs
                    .iter()
                    .zip(ds)
                    .map(|(x, dx)| dx.unwrap_or_else(|| self.zero_like(x)))
                    .collect();
                Ok(Some(Expression::piecewise(
                    conditions.iter().map(Rc::clone).collect(),
                    padded,
                )?))
            }
        }
    }

    fn d_name(&mut self, v: VarId) -> Result<Option<Rc<Expression>>, IntegrityError> {
        if self.target == DiffTarget::Name(v) {
            return Ok(Some(Expression::one()));
        }
        let model = self.model;
        let var = model.var(v);
        if var.is_state() {
            if self.independent_states {
                return Ok(None);
            }
            return Ok(if self.state_depends(v) {
                Some(Expression::partial(v, self.target))
            } else {
                None
            });
        }
        if var.is_bound() {
            // external inputs are constant with respect to anything else
            return Ok(None);
        }
        let rhs = match var.rhs() {
            Some(rhs) => Rc::clone(rhs),
            None => return Ok(None),
        };
        if self.active.contains(&v) {
            let mut path: Vec<String> = self.active.iter().map(|w| model.qname(*w)).collect();
            path.push(model.qname(v));
            return Err(IntegrityError::CyclicDependency {
                path: path.join(" -> "),
            });
        }
        self.active.push(v);
        let out = self.d(&rhs);
        self.active.pop();
        out
    }

    fn d_power(
        &mut self,
        a: &Rc<Expression>,
        b: &Rc<Expression>,
        da: Option<Rc<Expression>>,
        db: Option<Rc<Expression>>,
    ) -> Result<Option<Rc<Expression>>, IntegrityError> {
        Ok(match (da, db) {
            (None, None) => None,
            // constant exponent: n * a^(n-1) * a', with shortcuts for 1 and 2
            (Some(da), None) => match b.as_number() {
                Some(n) if n == 1.0 => Some(da),
                Some(n) if n == 2.0 => Some(mul(mul(two(), Rc::clone(a)), da)),
                Some(n) => Some(mul(
                    mul(
                        Expression::number(n, b.number_unit()),
                        pow(Rc::clone(a), Expression::number(n - 1.0, b.number_unit())),
                    ),
                    da,
                )),
                None => Some(mul(
                    mul(
                        Rc::clone(b),
                        pow(
                            Rc::clone(a),
                            sub(Rc::clone(b), Expression::one()),
                        ),
                    ),
                    da,
                )),
            },
            // constant base: a^b * ln(a) * b'
            (None, Some(db)) => Some(mul(
                mul(pow(Rc::clone(a), Rc::clone(b)), ln(Rc::clone(a))?),
                db,
            )),
            (Some(da), Some(db)) => Some(mul(
                pow(Rc::clone(a), Rc::clone(b)),
                add(
                    mul(db, ln(Rc::clone(a))?),
                    mul(Rc::clone(b), div(da, Rc::clone(a))),
                ),
            )),
        })
    }

    fn d_function(
        &mut self,
        e: &Rc<Expression>,
        f: Func,
        args: &[Rc<Expression>],
    ) -> Result<Option<Rc<Expression>>, IntegrityError> {
        let a = &args[0];
        if f == Func::Log && args.len() == 2 {
            return self.d_log_base(a, &args[1]);
        }
        let da = match self.d(a)? {
            None => return Ok(None),
            Some(da) => da,
        };
        let out = match f {
            Func::Sqrt => div(da, mul(two(), Rc::clone(e))),
            Func::Sin => mul(Expression::function(Func::Cos, vec![Rc::clone(a)])?, da),
            Func::Cos => neg(mul(
                Expression::function(Func::Sin, vec![Rc::clone(a)])?,
                da,
            )),
            Func::Tan => div(
                da,
                square(Expression::function(Func::Cos, vec![Rc::clone(a)])?),
            ),
            Func::ASin => div(
                da,
                Expression::function(Func::Sqrt, vec![sub(Expression::one(), square(Rc::clone(a)))])?,
            ),
            Func::ACos => neg(div(
                da,
                Expression::function(Func::Sqrt, vec![sub(Expression::one(), square(Rc::clone(a)))])?,
            )),
            Func::ATan => div(da, add(Expression::one(), square(Rc::clone(a)))),
            Func::Exp => mul(Rc::clone(e), da),
            Func::Log => div(da, Rc::clone(a)),
            Func::Log10 => div(
                da,
                mul(Rc::clone(a), ln(Expression::number(10.0, None))?),
            ),
            Func::Abs => Expression::if_(
                Expression::infix(
                    InfixOp::MoreEq,
                    Rc::clone(a),
                    Expression::number(0.0, None),
                ),
                Rc::clone(&da),
                neg(da),
            ),
            Func::Floor | Func::Ceil => return Ok(None),
        };
        Ok(Some(out))
    }

    /// `log(a, b) = ln(a) / ln(b)`, so
    /// `d = a' / (a * ln(b)) - ln(a) * b' / (b * ln(b)^2)`.
    fn d_log_base(
        &mut self,
        a: &Rc<Expression>,
        b: &Rc<Expression>,
    ) -> Result<Option<Rc<Expression>>, IntegrityError> {
        let da = self.d(a)?;
        let db = self.d(b)?;
        let first = match da {
            None => None,
            Some(da) => Some(div(da, mul(Rc::clone(a), ln(Rc::clone(b))?))),
        };
        let second = match db {
            None => None,
            Some(db) => Some(div(
                mul(ln(Rc::clone(a))?, db),
                mul(Rc::clone(b), square(ln(Rc::clone(b))?)),
            )),
        };
        Ok(match (first, second) {
            (None, None) => None,
            (Some(first), None) => Some(first),
            (None, Some(second)) => Some(neg(second)),
            (Some(first), Some(second)) => Some(sub(first, second)),
        })
    }

    /// Whether a state's trajectory transitively depends on the target:
    /// its own initial value, or any reference path from its derivative
    /// equation to the target variable.
    fn state_depends(&mut self, state: VarId) -> bool {
        let tv = self.target.var();
        if matches!(self.target, DiffTarget::Initial(_)) && state == tv {
            return true;
        }
        if let Some(&known) = self.state_memo.get(&state) {
            return known;
        }
        let model = self.model;
        let mut seen = HashSet::from([state]);
        let mut stack = vec![state];
        let mut found = false;
        'trace: while let Some(v) = stack.pop() {
            let eq = match model.var(v).rhs() {
                Some(eq) => eq,
                None => continue,
            };
            for r in eq.refs() {
                let w = r.var();
                if w == tv {
                    found = true;
                    break 'trace;
                }
                if seen.insert(w) {
                    stack.push(w);
                }
            }
        }
        self.state_memo.insert(state, found);
        found
    }

    /// A zero literal in `unit(e) / unit(target)`, units permitting.
    fn zero_like(&self, e: &Rc<Expression>) -> Rc<Expression> {
        let numer = e.eval_unit(self.model, UnitMode::Tolerant).ok().flatten();
        let denom = self.model.var(self.target.var()).unit();
        Expression::zero(combine_product(&numer, &denom, true, UnitMode::Tolerant))
    }
}

// ----- small builders ----------------------------------------------------

fn add(a: Rc<Expression>, b: Rc<Expression>) -> Rc<Expression> {
    Expression::infix(InfixOp::Plus, a, b)
}

fn sub(a: Rc<Expression>, b: Rc<Expression>) -> Rc<Expression> {
    Expression::infix(InfixOp::Minus, a, b)
}

/// Multiplication that drops dimensionless literal-one factors, so chain
/// rule products like `cos(x) * 1` come out as `cos(x)`.
fn mul(a: Rc<Expression>, b: Rc<Expression>) -> Rc<Expression> {
    let is_one = |e: &Rc<Expression>| {
        e.as_number() == Some(1.0) && e.number_unit().map_or(true, |u| u.is_dimensionless())
    };
    if is_one(&a) {
        return b;
    }
    if is_one(&b) {
        return a;
    }
    Expression::infix(InfixOp::Multiply, a, b)
}

fn div(a: Rc<Expression>, b: Rc<Expression>) -> Rc<Expression> {
    Expression::infix(InfixOp::Divide, a, b)
}

fn neg(a: Rc<Expression>) -> Rc<Expression> {
    Expression::prefix(PrefixOp::Minus, a)
}

fn pow(a: Rc<Expression>, b: Rc<Expression>) -> Rc<Expression> {
    Expression::infix(InfixOp::Power, a, b)
}

fn square(a: Rc<Expression>) -> Rc<Expression> {
    pow(a, two())
}

fn two() -> Rc<Expression> {
    Expression::number(2.0, None)
}

fn ln(a: Rc<Expression>) -> Result<Rc<Expression>, IntegrityError> {
    Expression::function(Func::Log, vec![a])
}

fn opt_sum(a: Option<Rc<Expression>>, b: Option<Rc<Expression>>) -> Option<Rc<Expression>> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(add(a, b)),
    }
}
