//! Dimensional analysis over expressions.
//!
//! `eval_unit` propagates units bottom-up under a [`UnitMode`]. In
//! tolerant mode an unspecified unit (`None`) is absorbed by known units;
//! in strict mode `None` is read as dimensionless and the result is always
//! a concrete unit. Results are cached per mode on each node.

use crate::error::UnitError;
use crate::expr::{ExprKind, Expression, Func, InfixOp, PrefixOp};
use crate::model::Model;
use crate::units::{combine_equal, combine_product, Unit, UnitMode};

impl Expression {
    /// Returns the unit of this expression, or an incompatible-unit
    /// failure. Strict mode never returns `Ok(None)`.
    pub fn eval_unit(&self, model: &Model, mode: UnitMode) -> Result<Option<Unit>, UnitError> {
        let idx = match mode {
            UnitMode::Tolerant => 0,
            UnitMode::Strict => 1,
        };
        self.unit_memo[idx]
            .get_or_init(|| self.compute_unit(model, mode))
            .clone()
    }

    fn compute_unit(&self, model: &Model, mode: UnitMode) -> Result<Option<Unit>, UnitError> {
        let strict = mode == UnitMode::Strict;
        // in strict mode an unspecified leaf reads as dimensionless
        let leaf = |unit: Option<Unit>| -> Option<Unit> {
            if strict {
                Some(unit.unwrap_or_else(Unit::dimensionless))
            } else {
                unit
            }
        };
        match &self.kind() {
            ExprKind::Number { unit, .. } => Ok(leaf(*unit)),
            ExprKind::Name(v) => Ok(leaf(model.var(*v).unit())),
            ExprKind::Derivative(v) => {
                let state = leaf(model.var(*v).unit());
                let time = leaf(model.time().and_then(|t| model.var(t).unit()));
                Ok(combine_product(&state, &time, true, mode))
            }
            ExprKind::Initial(v) => Ok(leaf(model.var(*v).unit())),
            ExprKind::Partial { dependent, target } => {
                let dep = leaf(model.var(*dependent).unit());
                let wrt = leaf(model.var(target.var()).unit());
                Ok(combine_product(&dep, &wrt, true, mode))
            }
            ExprKind::Prefix(op, child) => {
                let unit = child.eval_unit(model, mode)?;
                match op {
                    PrefixOp::Plus | PrefixOp::Minus => Ok(unit),
                    PrefixOp::Not => {
                        check_dimensionless(&unit, "operand of 'not'")?;
                        Ok(Some(Unit::dimensionless()))
                    }
                }
            }
            ExprKind::Infix(op, left, right) => {
                let l = left.eval_unit(model, mode)?;
                let r = right.eval_unit(model, mode)?;
                match op {
                    InfixOp::Plus | InfixOp::Minus => combine_equal(&l, &r, mode, op.symbol()),
                    InfixOp::Multiply => Ok(combine_product(&l, &r, false, mode)),
                    InfixOp::Divide | InfixOp::Quotient => {
                        Ok(combine_product(&l, &r, true, mode))
                    }
                    InfixOp::Remainder => combine_equal(&l, &r, mode, op.symbol()),
                    InfixOp::Power => {
                        check_dimensionless(&r, "exponent")?;
                        match l {
                            None => Ok(if strict {
                                Some(Unit::dimensionless())
                            } else {
                                None
                            }),
                            Some(base) if base.is_dimensionless() => {
                                Ok(Some(Unit::dimensionless()))
                            }
                            Some(base) => match right.as_number() {
                                // a literal exponent is allowed on any base
                                Some(n) => Ok(Some(base.power(n))),
                                None => Err(UnitError::new(format!(
                                    "base [{base}] can only be raised to a literal exponent"
                                ))),
                            },
                        }
                    }
                    op if op.is_comparison() => {
                        combine_equal(&l, &r, mode, op.symbol())?;
                        Ok(Some(Unit::dimensionless()))
                    }
                    _ => {
                        // and / or
                        check_dimensionless(&l, "operand of a boolean operator")?;
                        check_dimensionless(&r, "operand of a boolean operator")?;
                        Ok(Some(Unit::dimensionless()))
                    }
                }
            }
            ExprKind::Function(f, args) => {
                let units: Vec<Option<Unit>> = args
                    .iter()
                    .map(|a| a.eval_unit(model, mode))
                    .collect::<Result<_, _>>()?;
                match f {
                    Func::Sqrt => Ok(match units[0] {
                        None => {
                            if strict {
                                Some(Unit::dimensionless())
                            } else {
                                None
                            }
                        }
                        Some(u) => Some(u.power(0.5)),
                    }),
                    Func::Floor | Func::Ceil | Func::Abs => Ok(units[0]),
                    _ => {
                        for unit in &units {
                            check_dimensionless(unit, &format!("operand of {}()", f.name()))?;
                        }
                        Ok(Some(Unit::dimensionless()))
                    }
                }
            }
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                check_dimensionless(&cond.eval_unit(model, mode)?, "condition of if()")?;
                branch_units(
                    &[then.eval_unit(model, mode)?, otherwise.eval_unit(model, mode)?],
                    mode,
                    "if()",
                )
            }
            ExprKind::Piecewise { conditions, exprs } => {
                for cond in conditions {
                    check_dimensionless(
                        &cond.eval_unit(model, mode)?,
                        "condition of piecewise()",
                    )?;
                }
                let units: Vec<Option<Unit>> = exprs
                    .iter()
                    .map(|e| e.eval_unit(model, mode))
                    .collect::<Result<_, _>>()?;
                branch_units(&units, mode, "piecewise()")
            }
        }
    }
}

/// All branches must agree; tolerant mode absorbs at most one `None`
/// branch into the shared unit (all-`None` stays `None`).
fn branch_units(
    units: &[Option<Unit>],
    mode: UnitMode,
    context: &str,
) -> Result<Option<Unit>, UnitError> {
    if mode == UnitMode::Strict {
        let mut out = units[0].unwrap_or_else(Unit::dimensionless);
        for unit in &units[1..] {
            out = combine_equal(&Some(out), unit, mode, context)?
                .unwrap_or_else(Unit::dimensionless);
        }
        return Ok(Some(out));
    }
    let known: Vec<Unit> = units.iter().flatten().copied().collect();
    if known.is_empty() {
        return Ok(None);
    }
    for pair in known.windows(2) {
        if pair[0] != pair[1] {
            return Err(UnitError::new(format!(
                "[{}] does not match [{}] in {}",
                pair[0], pair[1], context
            )));
        }
    }
    let unknown = units.len() - known.len();
    if unknown > 1 {
        return Err(UnitError::new(format!(
            "more than one branch of {context} has no unit"
        )));
    }
    Ok(Some(known[0]))
}

fn check_dimensionless(unit: &Option<Unit>, what: &str) -> Result<(), UnitError> {
    match unit {
        None => Ok(()),
        Some(u) if u.is_dimensionless() => Ok(()),
        Some(u) => Err(UnitError::new(format!("{what} must be dimensionless, got [{u}]"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::InfixOp;
    use crate::model::{Model, VarId};
    use std::rc::Rc;

    fn membrane_model() -> (Model, VarId) {
        let mut model = Model::new("m");
        let c = model.add_component("membrane").unwrap();
        let v = model.add_variable(c, "V").unwrap();
        let mv = model.units().lookup("mV").unwrap();
        model.set_unit(v, mv);
        (model, v)
    }

    fn num(v: f64) -> Rc<Expression> {
        Expression::number(v, None)
    }

    #[test]
    fn tolerant_branch_agreement_in_millivolts() {
        let (model, v) = membrane_model();
        let mv = model.units().lookup("mV").unwrap();
        // if(V < 10, 5 * V + 100, 6 * V)
        let cond = Expression::infix(InfixOp::Less, Expression::name(v), num(10.0));
        let then = Expression::infix(
            InfixOp::Plus,
            Expression::infix(InfixOp::Multiply, num(5.0), Expression::name(v)),
            num(100.0),
        );
        let otherwise = Expression::infix(InfixOp::Multiply, num(6.0), Expression::name(v));
        let e = Expression::if_(cond, then, otherwise);
        assert_eq!(e.eval_unit(&model, UnitMode::Tolerant).unwrap(), Some(mv));
    }

    #[test]
    fn branch_mismatch_raises_in_both_modes() {
        let (model, v) = membrane_model();
        let ampere = model.units().lookup("A").unwrap();
        let cond = Expression::infix(InfixOp::Less, Expression::name(v), num(10.0));
        let then = Expression::infix(
            InfixOp::Multiply,
            Expression::number(6.0, Some(ampere)),
            Expression::name(v),
        );
        let otherwise = Expression::infix(InfixOp::Multiply, num(6.0), Expression::name(v));
        let e = Expression::if_(cond, then, otherwise);
        assert!(e.eval_unit(&model, UnitMode::Tolerant).is_err());
        assert!(e.eval_unit(&model, UnitMode::Strict).is_err());
    }

    #[test]
    fn strict_mode_never_returns_none() {
        let model = Model::new("m");
        let e = Expression::infix(InfixOp::Multiply, num(2.0), num(3.0));
        assert_eq!(
            e.eval_unit(&model, UnitMode::Strict).unwrap(),
            Some(Unit::dimensionless())
        );
        assert_eq!(e.eval_unit(&model, UnitMode::Tolerant).unwrap(), None);
    }

    #[test]
    fn strict_addition_of_unit_and_plain_number_fails() {
        let (model, v) = membrane_model();
        let e = Expression::infix(InfixOp::Plus, Expression::name(v), num(1.0));
        // tolerant absorbs the None literal, strict reads it as dimensionless
        let mv = model.units().lookup("mV").unwrap();
        assert_eq!(e.eval_unit(&model, UnitMode::Tolerant).unwrap(), Some(mv));
        assert!(e.eval_unit(&model, UnitMode::Strict).is_err());
    }

    #[test]
    fn literal_exponents_work_on_any_base() {
        let (model, v) = membrane_model();
        let mv = model.units().lookup("mV").unwrap();
        let square = Expression::infix(InfixOp::Power, Expression::name(v), num(2.0));
        assert_eq!(
            square.eval_unit(&model, UnitMode::Tolerant).unwrap(),
            Some(mv.power(2.0))
        );
        // a non-literal exponent on a dimensioned base is rejected
        let bad = Expression::infix(
            InfixOp::Power,
            Expression::name(v),
            Expression::infix(InfixOp::Plus, num(1.0), num(1.0)),
        );
        assert!(bad.eval_unit(&model, UnitMode::Tolerant).is_err());
        // and a dimensioned exponent is rejected outright
        let worse = Expression::infix(
            InfixOp::Power,
            num(2.0),
            Expression::name(v),
        );
        assert!(worse.eval_unit(&model, UnitMode::Strict).is_err());
    }

    #[test]
    fn derivative_unit_divides_by_time() {
        let (mut model, v) = membrane_model();
        let c = model.component_by_name("membrane").unwrap();
        let t = model.add_variable(c, "t").unwrap();
        let ms = model.units().lookup("ms").unwrap();
        model.set_unit(t, ms);
        model.set_binding(t, "time").unwrap();
        let mv = model.units().lookup("mV").unwrap();
        let e = Expression::derivative(v);
        assert_eq!(
            e.eval_unit(&model, UnitMode::Tolerant).unwrap(),
            Some(mv.divide(&ms))
        );
    }

    #[test]
    fn results_are_cached_per_mode() {
        let (model, v) = membrane_model();
        let e = Expression::infix(InfixOp::Plus, Expression::name(v), num(1.0));
        let first = e.eval_unit(&model, UnitMode::Tolerant).unwrap();
        let second = e.eval_unit(&model, UnitMode::Tolerant).unwrap();
        assert_eq!(first, second);
        assert!(e.eval_unit(&model, UnitMode::Strict).is_err());
    }
}
