//! Tree-walking numeric evaluation.
//!
//! Any arithmetic failure is caught at the node where it happens and
//! wrapped into a single [`EvalError`] carrying the failing
//! sub-expression, its operand values and the value or equation of every
//! transitively referenced variable. Raw non-finite floats never escape.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::EvalError;
use crate::expr::{ExprKind, Expression, Func, InfixOp, PrefixOp, Ref};
use crate::model::{Model, VarId};
use crate::utils::format_float;

/// Numeric precision for evaluation. `Single` rounds every intermediate
/// result through f32, mimicking single-precision execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    fn round(&self, value: f64) -> f64 {
        match self {
            Precision::Single => value as f32 as f64,
            Precision::Double => value,
        }
    }
}

impl Expression {
    /// Evaluates this expression to a float. `Name` references follow the
    /// variable's defining equation (states use their initial value,
    /// `dot(x)` uses the derivative equation) unless a substitution entry
    /// overrides them.
    pub fn eval(
        self: &Rc<Expression>,
        model: &Model,
        substitutions: Option<&HashMap<Ref, f64>>,
        precision: Precision,
    ) -> Result<f64, EvalError> {
        let mut ev = Evaluator {
            model,
            substitutions,
            precision,
            active: Vec::new(),
        };
        ev.eval(self)
    }
}

struct Evaluator<'a> {
    model: &'a Model,
    substitutions: Option<&'a HashMap<Ref, f64>>,
    precision: Precision,
    /// Variables currently being resolved, to catch unvalidated cycles.
    active: Vec<VarId>,
}

impl<'a> Evaluator<'a> {
    fn lookup(&self, r: Ref) -> Option<f64> {
        self.substitutions.and_then(|s| s.get(&r)).copied()
    }

    fn eval(&mut self, node: &Rc<Expression>) -> Result<f64, EvalError> {
        let value = match node.kind() {
            ExprKind::Number { value, .. } => *value,
            ExprKind::Name(v) => {
                if let Some(value) = self.lookup(Ref::Name(*v)) {
                    value
                } else {
                    self.eval_variable(node, *v)?
                }
            }
            ExprKind::Derivative(v) => {
                if let Some(value) = self.lookup(Ref::Derivative(*v)) {
                    value
                } else if self.model.var(*v).is_state() {
                    let rhs = match self.model.var(*v).rhs() {
                        Some(rhs) => Rc::clone(rhs),
                        None => {
                            return Err(self.fail(
                                node,
                                format!(
                                    "state '{}' has no derivative equation",
                                    self.model.qname(*v)
                                ),
                                &[],
                            ))
                        }
                    };
                    self.resolve(node, *v, &rhs)?
                } else {
                    return Err(self.fail(
                        node,
                        format!("'{}' is not a state variable", self.model.qname(*v)),
                        &[],
                    ));
                }
            }
            ExprKind::Initial(v) => {
                if let Some(value) = self.lookup(Ref::Initial(*v)) {
                    value
                } else {
                    match self.model.var(*v).initial() {
                        Some(init) => {
                            let init = Rc::clone(init);
                            self.resolve(node, *v, &init)?
                        }
                        None => {
                            return Err(self.fail(
                                node,
                                format!("'{}' has no initial value", self.model.qname(*v)),
                                &[],
                            ))
                        }
                    }
                }
            }
            ExprKind::Partial { .. } => {
                return Err(self.fail(
                    node,
                    "a symbolic partial derivative has no numeric value".to_string(),
                    &[],
                ))
            }
            ExprKind::Prefix(op, child) => {
                let x = self.eval(child)?;
                match op {
                    PrefixOp::Plus => x,
                    PrefixOp::Minus => -x,
                    PrefixOp::Not => bool_to_f64(x == 0.0),
                }
            }
            ExprKind::Infix(op, left, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                match op {
                    InfixOp::Plus => l + r,
                    InfixOp::Minus => l - r,
                    InfixOp::Multiply => l * r,
                    InfixOp::Divide => {
                        if r == 0.0 {
                            return Err(self.fail(node, "division by zero".into(), &[l, r]));
                        }
                        l / r
                    }
                    InfixOp::Quotient => {
                        if r == 0.0 {
                            return Err(self.fail(node, "division by zero".into(), &[l, r]));
                        }
                        (l / r).floor()
                    }
                    InfixOp::Remainder => {
                        if r == 0.0 {
                            return Err(self.fail(node, "division by zero".into(), &[l, r]));
                        }
                        l - r * (l / r).floor()
                    }
                    InfixOp::Power => {
                        let out = l.powf(r);
                        if out.is_nan() {
                            return Err(self.fail(
                                node,
                                format!(
                                    "domain error: {}^{}",
                                    format_float(l),
                                    format_float(r)
                                ),
                                &[l, r],
                            ));
                        }
                        out
                    }
                    InfixOp::Eq => bool_to_f64(l == r),
                    InfixOp::NotEq => bool_to_f64(l != r),
                    InfixOp::Less => bool_to_f64(l < r),
                    InfixOp::LessEq => bool_to_f64(l <= r),
                    InfixOp::More => bool_to_f64(l > r),
                    InfixOp::MoreEq => bool_to_f64(l >= r),
                    InfixOp::And => bool_to_f64(l != 0.0 && r != 0.0),
                    InfixOp::Or => bool_to_f64(l != 0.0 || r != 0.0),
                }
            }
            ExprKind::Function(f, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                let x = values[0];
                let out = match f {
                    Func::Sqrt => x.sqrt(),
                    Func::Sin => x.sin(),
                    Func::Cos => x.cos(),
                    Func::Tan => x.tan(),
                    Func::ASin => x.asin(),
                    Func::ACos => x.acos(),
                    Func::ATan => x.atan(),
                    Func::Exp => x.exp(),
                    Func::Log => {
                        if values.len() == 2 {
                            x.ln() / values[1].ln()
                        } else {
                            x.ln()
                        }
                    }
                    Func::Log10 => x.log10(),
                    Func::Floor => x.floor(),
                    Func::Ceil => x.ceil(),
                    Func::Abs => x.abs(),
                };
                if !out.is_finite() {
                    return Err(self.fail(
                        node,
                        format!("domain error in {}()", f.name()),
                        &values,
                    ));
                }
                out
            }
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)? != 0.0 {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            ExprKind::Piecewise { conditions, exprs } => {
                let mut chosen = &exprs[exprs.len() - 1];
                for (c, e) in conditions.iter().zip(exprs.iter()) {
                    if self.eval(c)? != 0.0 {
                        chosen = e;
                        break;
                    }
                }
                self.eval(chosen)?
            }
        };
        if !value.is_finite() {
            return Err(self.fail(node, "result is not a finite number".into(), &[]));
        }
        Ok(self.precision.round(value))
    }

    fn eval_variable(&mut self, node: &Rc<Expression>, v: VarId) -> Result<f64, EvalError> {
        let var = self.model.var(v);
        if var.is_state() {
            let init = match var.initial() {
                Some(init) => Rc::clone(init),
                None => {
                    return Err(self.fail(
                        node,
                        format!("state '{}' has no initial value", self.model.qname(v)),
                        &[],
                    ))
                }
            };
            return self.resolve(node, v, &init);
        }
        match var.rhs() {
            Some(rhs) => {
                let rhs = Rc::clone(rhs);
                self.resolve(node, v, &rhs)
            }
            None => Err(self.fail(
                node,
                format!(
                    "no value given for external input '{}'",
                    self.model.qname(v)
                ),
                &[],
            )),
        }
    }

    fn resolve(
        &mut self,
        node: &Rc<Expression>,
        v: VarId,
        expr: &Rc<Expression>,
    ) -> Result<f64, EvalError> {
        if self.active.contains(&v) {
            return Err(self.fail(
                node,
                format!("cyclic reference while resolving '{}'", self.model.qname(v)),
                &[],
            ));
        }
        self.active.push(v);
        let out = self.eval(expr);
        self.active.pop();
        out
    }

    /// Assembles the full diagnostic at the point of failure.
    fn fail(&self, node: &Rc<Expression>, message: String, operands: &[f64]) -> EvalError {
        let operand_pairs = node
            .children()
            .iter()
            .zip(operands.iter())
            .map(|(child, value)| (child.code(self.model, None), *value))
            .collect();
        EvalError {
            message,
            expression: node.code(self.model, None),
            operands: operand_pairs,
            trail: self.trail(node),
        }
    }

    /// One line per transitively referenced variable: its value if it can
    /// be computed, its defining equation otherwise.
    fn trail(&self, node: &Rc<Expression>) -> Vec<String> {
        let mut queue: Vec<VarId> = node.refs().iter().map(|r| r.var()).collect();
        let mut seen: Vec<VarId> = queue.clone();
        let mut lines = Vec::new();
        while !queue.is_empty() {
            let v = queue.remove(0);
            let var = self.model.var(v);
            let mut sub = Evaluator {
                model: self.model,
                substitutions: self.substitutions,
                precision: self.precision,
                active: Vec::new(),
            };
            let line = match sub.eval(&Expression::name(v)) {
                Ok(value) => format!("{} = {}", self.model.qname(v), format_float(value)),
                Err(_) => match var.rhs() {
                    Some(rhs) => format!(
                        "{} = {}",
                        self.model.qname(v),
                        rhs.code(self.model, None)
                    ),
                    None => format!("{} is an external input", self.model.qname(v)),
                },
            };
            lines.push(line);
            if let Some(rhs) = var.rhs() {
                for r in rhs.refs() {
                    let t = r.var();
                    if !seen.contains(&t) {
                        seen.push(t);
                        queue.push(t);
                    }
                }
            }
        }
        lines
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::InfixOp;
    use crate::model::Model;

    fn num(v: f64) -> Rc<Expression> {
        Expression::number(v, None)
    }

    fn eval(e: &Rc<Expression>, model: &Model) -> f64 {
        e.eval(model, None, Precision::Double).unwrap()
    }

    #[test]
    fn floor_division_and_remainder_round_toward_negative_infinity() {
        let model = Model::new("m");
        let q = Expression::infix(InfixOp::Quotient, num(5.0), num(-3.0));
        assert_eq!(eval(&q, &model), -2.0);
        let r = Expression::infix(InfixOp::Remainder, num(5.0), num(-3.0));
        assert_eq!(eval(&r, &model), -1.0);
    }

    #[test]
    fn names_follow_their_equations() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let a = model.add_variable(c, "a").unwrap();
        let b = model.add_variable(c, "b").unwrap();
        model.set_rhs(a, num(3.0));
        model.set_rhs(
            b,
            Expression::infix(InfixOp::Multiply, Expression::name(a), num(4.0)),
        );
        assert_eq!(eval(&Expression::name(b), &model), 12.0);
        // substitution overrides the equation
        let subs: HashMap<Ref, f64> = [(Ref::Name(a), 10.0)].into();
        let v = Expression::name(b)
            .eval(&model, Some(&subs), Precision::Double)
            .unwrap();
        assert_eq!(v, 40.0);
    }

    #[test]
    fn states_evaluate_to_their_initial_value() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        model.set_rhs(x, num(-1.0)); // derivative equation
        model.promote_to_state(x, num(7.0)).unwrap();
        assert_eq!(eval(&Expression::name(x), &model), 7.0);
        assert_eq!(eval(&Expression::derivative(x), &model), -1.0);
        assert_eq!(eval(&Expression::initial(x), &model), 7.0);
    }

    #[test]
    fn single_precision_rounds_intermediates() {
        let model = Model::new("m");
        let e = Expression::infix(InfixOp::Plus, num(0.1), num(0.2));
        let double = e.eval(&model, None, Precision::Double).unwrap();
        let single = e.eval(&model, None, Precision::Single).unwrap();
        assert_ne!(double, single);
        assert_eq!(single, (0.1f32 as f64 + 0.2f32 as f64) as f32 as f64);
    }

    #[test]
    fn division_by_zero_produces_a_rich_diagnostic() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let d = model.add_variable(c, "d").unwrap();
        model.set_rhs(d, num(0.0));
        let e = Expression::infix(InfixOp::Divide, num(1.0), Expression::name(d));
        let err = e.eval(&model, None, Precision::Double).unwrap_err();
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.expression, "1 / c.d");
        assert_eq!(err.operands, vec![("1".to_string(), 1.0), ("c.d".to_string(), 0.0)]);
        assert_eq!(err.trail, vec!["c.d = 0".to_string()]);
    }

    #[test]
    fn piecewise_picks_the_first_true_condition() {
        let model = Model::new("m");
        let pw = Expression::piecewise(
            vec![num(0.0), num(1.0)],
            vec![num(10.0), num(20.0), num(30.0)],
        )
        .unwrap();
        assert_eq!(eval(&pw, &model), 20.0);
        let cond = Expression::infix(InfixOp::Less, num(5.0), num(10.0));
        let e = Expression::if_(cond, num(1.0), num(2.0));
        assert_eq!(eval(&e, &model), 1.0);
    }

    #[test]
    fn missing_external_input_is_an_eval_error() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let t = model.add_variable(c, "t").unwrap();
        model.set_binding(t, "time").unwrap();
        let e = Expression::name(t);
        assert!(e.eval(&model, None, Precision::Double).is_err());
        let subs: HashMap<Ref, f64> = [(Ref::Name(t), 2.5)].into();
        assert_eq!(e.eval(&model, Some(&subs), Precision::Double).unwrap(), 2.5);
    }
}
