//! Whole-model validation: dependency cycles, scope legality, the time
//! binding and unused-variable reporting.
//!
//! The dependency graph follows each equation's reference set. A `Name`
//! edge to a state or bound variable is terminal: a state's current value
//! does not depend on its own derivative equation, and bound values come
//! from outside the model. A `dot()` reference does depend on the target's
//! derivative equation.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::error::{IntegrityError, Warning};
use crate::expr::Ref;
use crate::model::{Model, Scope, VarId};

/// Checks the whole model; fatal findings are errors, recoverable ones
/// come back as warnings (also emitted through `log::warn!`).
pub fn validate(model: &Model) -> Result<Vec<Warning>, IntegrityError> {
    check_time(model)?;
    check_equations(model)?;
    check_cycles(model)?;
    let used = used_set(model);
    let mut warnings = Vec::new();
    for v in model.all_variables() {
        if !used.contains(&v) && !is_exempt(model, v) {
            let warning = Warning::UnusedVariable {
                variable: model.qname(v),
            };
            log::warn!("{warning}");
            warnings.push(warning);
        }
    }
    Ok(warnings)
}

/// Removes unused variables until a fixpoint, returning one warning per
/// removal. Parents are only removed once all their children are gone.
pub fn prune_unused(model: &mut Model) -> Vec<Warning> {
    let mut removed = Vec::new();
    loop {
        let used = used_set(model);
        let candidates: Vec<VarId> = model
            .all_variables()
            .into_iter()
            .filter(|&v| is_prunable(model, v, &used))
            .collect();
        if candidates.is_empty() {
            return removed;
        }
        for v in candidates {
            let warning = Warning::UnusedVariable {
                variable: model.qname(v),
            };
            if model.remove_variable(v).is_ok() {
                removed.push(warning);
            }
        }
    }
}

fn is_exempt(model: &Model, v: VarId) -> bool {
    let var = model.var(v);
    var.is_state() || var.is_bound() || var.label().is_some()
}

fn is_prunable(model: &Model, v: VarId, used: &HashSet<VarId>) -> bool {
    !used.contains(&v) && !is_exempt(model, v) && model.var(v).children().is_empty()
}

/// Variables referenced from any equation other than their own, plus the
/// ancestors of every such variable.
fn used_set(model: &Model) -> HashSet<VarId> {
    let mut used = HashSet::new();
    for (owner, eq) in model.all_equations() {
        for r in eq.refs() {
            if r.var() != owner {
                used.insert(r.var());
            }
        }
    }
    let mut queue: Vec<VarId> = used.iter().copied().collect();
    while let Some(v) = queue.pop() {
        if let Some(parent) = model.var(v).parent() {
            if used.insert(parent) {
                queue.push(parent);
            }
        }
    }
    used
}

fn check_time(model: &Model) -> Result<(), IntegrityError> {
    match model.time() {
        Some(_) => Ok(()),
        None => Err(IntegrityError::InvalidBinding {
            label: "time".into(),
            detail: "no variable is bound to 'time'".into(),
        }),
    }
}

/// Missing right-hand sides and scope legality of every reference.
fn check_equations(model: &Model) -> Result<(), IntegrityError> {
    for v in model.all_variables() {
        let var = model.var(v);
        if var.rhs().is_none() && !var.is_bound() {
            return Err(IntegrityError::MissingRhs {
                variable: model.qname(v),
            });
        }
        let scope = Scope::variable(var.component(), v);
        for eq in [var.rhs(), var.initial()].into_iter().flatten() {
            for r in eq.refs() {
                let target = r.var();
                if !model.visible_from(target, &scope) {
                    return Err(IntegrityError::IllegalReference {
                        reference: model.qname(target),
                        scope: model.qname(v),
                    });
                }
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Grey,
    Black,
}

fn check_cycles(model: &Model) -> Result<(), IntegrityError> {
    let mut marks: HashMap<VarId, Mark> = HashMap::new();
    for v in model.all_variables() {
        if !marks.contains_key(&v) {
            visit(model, v, &mut marks, &mut Vec::new())?;
        }
    }
    Ok(())
}

fn visit(
    model: &Model,
    v: VarId,
    marks: &mut HashMap<VarId, Mark>,
    path: &mut Vec<VarId>,
) -> Result<(), IntegrityError> {
    marks.insert(v, Mark::Grey);
    path.push(v);
    if let Some(rhs) = model.var(v).rhs() {
        for r in rhs.refs() {
            let edge = match r {
                Ref::Name(t) => {
                    let target = model.var(*t);
                    if target.is_state() || target.is_bound() {
                        continue;
                    }
                    *t
                }
                Ref::Derivative(t) => *t,
                _ => continue,
            };
            match marks.get(&edge) {
                Some(Mark::Grey) => {
                    let start = path.iter().position(|&p| p == edge).unwrap_or(0);
                    let names = path[start..]
                        .iter()
                        .chain(std::iter::once(&edge))
                        .map(|&p| model.qname(p))
                        .join(" -> ");
                    return Err(IntegrityError::CyclicDependency { path: names });
                }
                Some(Mark::Black) => continue,
                None => visit(model, edge, marks, path)?,
            }
        }
    }
    path.pop();
    marks.insert(v, Mark::Black);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expression, InfixOp};
    use crate::model::CompId;

    fn base_model() -> (Model, CompId) {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let t = model.add_variable(c, "t").unwrap();
        model.set_rhs(t, Expression::number(0.0, None));
        model.set_binding(t, "time").unwrap();
        (model, c)
    }

    #[test]
    fn two_variable_cycle_names_both() {
        let (mut model, c) = base_model();
        let a = model.add_variable(c, "a").unwrap();
        let b = model.add_variable(c, "b").unwrap();
        model.set_rhs(
            a,
            Expression::infix(InfixOp::Plus, Expression::name(b), Expression::one()),
        );
        model.set_rhs(
            b,
            Expression::infix(InfixOp::Plus, Expression::name(a), Expression::one()),
        );
        let err = validate(&model).unwrap_err();
        match err {
            IntegrityError::CyclicDependency { path } => {
                assert!(path.contains("c.a"), "{path}");
                assert!(path.contains("c.b"), "{path}");
            }
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn state_feedback_is_not_a_cycle() {
        let (mut model, c) = base_model();
        let x = model.add_variable(c, "x").unwrap();
        model.set_rhs(
            x,
            Expression::prefix(crate::expr::PrefixOp::Minus, Expression::name(x)),
        );
        model.promote_to_state(x, Expression::number(1.0, None)).unwrap();
        assert!(validate(&model).is_ok());
    }

    #[test]
    fn cross_component_reference_requires_an_alias() {
        let (mut model, c) = base_model();
        let d = model.add_component("d").unwrap();
        let source = model.add_variable(c, "source").unwrap();
        model.set_rhs(source, Expression::number(2.0, None));
        let sink = model.add_variable(d, "sink").unwrap();
        model.set_rhs(sink, Expression::name(source));
        let err = validate(&model).unwrap_err();
        assert!(matches!(err, IntegrityError::IllegalReference { .. }));
        model.add_alias(d, "src", source).unwrap();
        assert!(validate(&model).is_ok());
    }

    #[test]
    fn time_binding_is_required() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        model.set_rhs(x, Expression::number(1.0, None));
        assert!(matches!(
            validate(&model),
            Err(IntegrityError::InvalidBinding { .. })
        ));
    }

    #[test]
    fn missing_rhs_is_fatal() {
        let (mut model, c) = base_model();
        model.add_variable(c, "empty").unwrap();
        assert!(matches!(
            validate(&model),
            Err(IntegrityError::MissingRhs { .. })
        ));
    }

    #[test]
    fn unused_variables_warn_and_prune() {
        let (mut model, c) = base_model();
        let used = model.add_variable(c, "used").unwrap();
        let user = model.add_variable(c, "user").unwrap();
        let dead = model.add_variable(c, "dead").unwrap();
        model.set_rhs(used, Expression::number(1.0, None));
        model.set_rhs(user, Expression::name(used));
        model.set_label(user, "output").unwrap();
        model.set_rhs(dead, Expression::number(2.0, None));
        let warnings = validate(&model).unwrap();
        assert_eq!(
            warnings,
            vec![Warning::UnusedVariable {
                variable: "c.dead".into()
            }]
        );
        let removed = prune_unused(&mut model);
        assert_eq!(removed.len(), 1);
        assert!(validate(&model).unwrap().is_empty());
        assert_eq!(model.variables(c).count(), 3);
    }

    #[test]
    fn chained_unused_variables_prune_to_fixpoint() {
        let (mut model, c) = base_model();
        let a = model.add_variable(c, "a").unwrap();
        let b = model.add_variable(c, "b").unwrap();
        model.set_rhs(a, Expression::number(1.0, None));
        model.set_rhs(b, Expression::name(a));
        // b is unused; removing it makes a unused too
        let removed = prune_unused(&mut model);
        assert_eq!(removed.len(), 2);
        assert_eq!(model.variables(c).count(), 1);
    }
}
