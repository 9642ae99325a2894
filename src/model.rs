//! Model, Component and Variable: the two-level namespace behind every
//! `Name` node. Variables are interned in an arena and referenced by
//! `VarId`, so expression equality is index-based, never pointer-based.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::IntegrityError;
use crate::expr::{Expression, Ref};
use crate::parser::tokenizer::is_keyword;
use crate::units::{Unit, UnitRegistry};

/// Arena index of a Variable. Stable for the model's lifetime: removal
/// leaves a tombstone, so indices are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Index of a Component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompId(pub usize);

/// Derived classification of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Value fixed by a reference-free (transitively constant) equation.
    Constant,
    /// Value supplied externally through a binding label.
    Bound,
    /// Has an initial value and a time-derivative equation.
    State,
    /// Computed from other variables at every evaluation.
    Intermediary,
}

/// The position from which an expression is parsed or validated: a
/// component, optionally narrowed to a variable's nested scope.
#[derive(Debug, Clone, Copy)]
pub struct Scope {
    pub component: CompId,
    pub variable: Option<VarId>,
}

impl Scope {
    pub fn component(component: CompId) -> Self {
        Self {
            component,
            variable: None,
        }
    }

    pub fn variable(component: CompId, variable: VarId) -> Self {
        Self {
            component,
            variable: Some(variable),
        }
    }
}

#[derive(Debug)]
pub struct Variable {
    name: String,
    component: CompId,
    parent: Option<VarId>,
    children: Vec<VarId>,
    unit: Option<Unit>,
    /// Defining equation; for states this is the time-derivative equation.
    rhs: Option<Rc<Expression>>,
    /// Initial value; present exactly for states.
    initial: Option<Rc<Expression>>,
    binding: Option<String>,
    label: Option<String>,
    description: Option<String>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> CompId {
        self.component
    }

    pub fn parent(&self) -> Option<VarId> {
        self.parent
    }

    pub fn children(&self) -> &[VarId] {
        &self.children
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn rhs(&self) -> Option<&Rc<Expression>> {
        self.rhs.as_ref()
    }

    pub fn initial(&self) -> Option<&Rc<Expression>> {
        self.initial.as_ref()
    }

    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_state(&self) -> bool {
        self.initial.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

#[derive(Debug)]
pub struct Component {
    name: String,
    /// Top-level variables, insertion order preserved for code emission.
    vars: Vec<VarId>,
    /// `use other.var as local` declarations, insertion order.
    aliases: Vec<(String, VarId)>,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables(&self) -> &[VarId] {
        &self.vars
    }

    pub fn aliases(&self) -> &[(String, VarId)] {
        &self.aliases
    }
}

/// A model: components, an interned variable arena, the ordered state
/// vector and the binding/label tables. Owns its unit registry.
#[derive(Debug)]
pub struct Model {
    name: String,
    components: Vec<Component>,
    comp_index: HashMap<String, CompId>,
    vars: Vec<Option<Variable>>,
    states: Vec<VarId>,
    units: UnitRegistry,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            comp_index: HashMap::new(),
            vars: Vec::new(),
            states: Vec::new(),
            units: UnitRegistry::si(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), IntegrityError> {
        check_name(name)?;
        self.name = name.to_string();
        Ok(())
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    // ----- components ---------------------------------------------------

    pub fn add_component(&mut self, name: &str) -> Result<CompId, IntegrityError> {
        check_name(name)?;
        if self.comp_index.contains_key(name) {
            return Err(IntegrityError::DuplicateName { name: name.into() });
        }
        let id = CompId(self.components.len());
        self.components.push(Component {
            name: name.to_string(),
            vars: Vec::new(),
            aliases: Vec::new(),
        });
        self.comp_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn component(&self, id: CompId) -> &Component {
        &self.components[id.0]
    }

    pub fn component_by_name(&self, name: &str) -> Option<CompId> {
        self.comp_index.get(name).copied()
    }

    /// Components in insertion order.
    pub fn components(&self) -> impl Iterator<Item = CompId> {
        (0..self.components.len()).map(CompId)
    }

    // ----- variables ----------------------------------------------------

    pub fn add_variable(&mut self, component: CompId, name: &str) -> Result<VarId, IntegrityError> {
        check_name(name)?;
        if self
            .components[component.0]
            .vars
            .iter()
            .any(|&v| self.var(v).name == name)
            || self.components[component.0]
                .aliases
                .iter()
                .any(|(alias, _)| alias == name)
        {
            return Err(IntegrityError::DuplicateName { name: name.into() });
        }
        let id = self.intern(Variable {
            name: name.to_string(),
            component,
            parent: None,
            children: Vec::new(),
            unit: None,
            rhs: None,
            initial: None,
            binding: None,
            label: None,
            description: None,
        });
        self.components[component.0].vars.push(id);
        Ok(id)
    }

    pub fn add_nested_variable(
        &mut self,
        parent: VarId,
        name: &str,
    ) -> Result<VarId, IntegrityError> {
        check_name(name)?;
        if self
            .var(parent)
            .children
            .iter()
            .any(|&c| self.var(c).name == name)
        {
            return Err(IntegrityError::DuplicateName { name: name.into() });
        }
        let component = self.var(parent).component;
        let id = self.intern(Variable {
            name: name.to_string(),
            component,
            parent: Some(parent),
            children: Vec::new(),
            unit: None,
            rhs: None,
            initial: None,
            binding: None,
            label: None,
            description: None,
        });
        self.var_mut(parent).children.push(id);
        Ok(id)
    }

    fn intern(&mut self, var: Variable) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(Some(var));
        id
    }

    pub fn var(&self, id: VarId) -> &Variable {
        self.vars[id.0].as_ref().expect("variable was removed")
    }

    fn var_mut(&mut self, id: VarId) -> &mut Variable {
        self.vars[id.0].as_mut().expect("variable was removed")
    }

    /// Top-level variables of a component, insertion order.
    pub fn variables(&self, component: CompId) -> impl Iterator<Item = VarId> + '_ {
        self.components[component.0].vars.iter().copied()
    }

    /// Every live variable, component by component, nested variables
    /// depth-first after their parent.
    pub fn all_variables(&self) -> Vec<VarId> {
        let mut out = Vec::new();
        for comp in &self.components {
            let mut stack: Vec<VarId> = comp.vars.iter().rev().copied().collect();
            while let Some(id) = stack.pop() {
                out.push(id);
                for &child in self.var(id).children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        out
    }

    // ----- variable attributes ------------------------------------------

    pub fn set_rhs(&mut self, id: VarId, rhs: Rc<Expression>) {
        self.var_mut(id).rhs = Some(rhs);
    }

    pub fn set_unit(&mut self, id: VarId, unit: Unit) {
        self.var_mut(id).unit = Some(unit);
    }

    pub fn set_description(&mut self, id: VarId, text: &str) {
        self.var_mut(id).description = Some(text.to_string());
    }

    pub fn set_binding(&mut self, id: VarId, label: &str) -> Result<(), IntegrityError> {
        if self.var(id).is_state() {
            return Err(IntegrityError::InvalidBinding {
                label: label.into(),
                detail: format!("'{}' is a state variable", self.qname(id)),
            });
        }
        if let Some(existing) = self.binding(label) {
            if existing != id {
                return Err(IntegrityError::InvalidBinding {
                    label: label.into(),
                    detail: format!("already bound to '{}'", self.qname(existing)),
                });
            }
        }
        self.var_mut(id).binding = Some(label.to_string());
        Ok(())
    }

    pub fn set_label(&mut self, id: VarId, label: &str) -> Result<(), IntegrityError> {
        if let Some(existing) = self.labelled(label) {
            if existing != id {
                return Err(IntegrityError::InvalidBinding {
                    label: label.into(),
                    detail: format!("label already used by '{}'", self.qname(existing)),
                });
            }
        }
        self.var_mut(id).label = Some(label.to_string());
        Ok(())
    }

    pub fn add_alias(
        &mut self,
        component: CompId,
        name: &str,
        target: VarId,
    ) -> Result<(), IntegrityError> {
        check_name(name)?;
        let comp = &self.components[component.0];
        if comp.aliases.iter().any(|(alias, _)| alias == name)
            || comp.vars.iter().any(|&v| self.var(v).name == name)
        {
            return Err(IntegrityError::DuplicateName { name: name.into() });
        }
        self.components[component.0]
            .aliases
            .push((name.to_string(), target));
        Ok(())
    }

    // ----- states -------------------------------------------------------

    /// Promotes a variable to a state. Its `rhs` becomes the derivative
    /// equation; the given expression is its initial value.
    pub fn promote_to_state(
        &mut self,
        id: VarId,
        initial: Rc<Expression>,
    ) -> Result<(), IntegrityError> {
        if self.var(id).is_state() {
            return Err(IntegrityError::AlreadyAState {
                variable: self.qname(id),
            });
        }
        if self.var(id).is_bound() {
            return Err(IntegrityError::InvalidBinding {
                label: self.var(id).binding.clone().unwrap_or_default(),
                detail: "a bound variable cannot become a state".into(),
            });
        }
        self.var_mut(id).initial = Some(initial);
        self.states.push(id);
        Ok(())
    }

    /// Demotes a state back to an ordinary variable. Rejected while any
    /// other equation still refers to `dot(id)` or to its initial value.
    pub fn demote_state(&mut self, id: VarId) -> Result<(), IntegrityError> {
        if !self.var(id).is_state() {
            return Err(IntegrityError::NotAState {
                variable: self.qname(id),
            });
        }
        for (owner, expr) in self.all_equations() {
            if owner == id {
                continue;
            }
            if expr
                .refs()
                .iter()
                .any(|r| matches!(r, Ref::Derivative(v) | Ref::Initial(v) if *v == id))
            {
                return Err(IntegrityError::VariableInUse {
                    variable: self.qname(id),
                    referrer: self.qname(owner),
                });
            }
        }
        self.var_mut(id).initial = None;
        self.states.retain(|&s| s != id);
        Ok(())
    }

    pub fn set_initial(&mut self, id: VarId, initial: Rc<Expression>) -> Result<(), IntegrityError> {
        if !self.var(id).is_state() {
            return Err(IntegrityError::NotAState {
                variable: self.qname(id),
            });
        }
        self.var_mut(id).initial = Some(initial);
        Ok(())
    }

    /// The ordered state vector. Order is externally meaningful.
    pub fn states(&self) -> &[VarId] {
        &self.states
    }

    /// Moves a state to a new position in the state vector.
    pub fn move_state(&mut self, id: VarId, index: usize) -> Result<(), IntegrityError> {
        let old = self
            .states
            .iter()
            .position(|&s| s == id)
            .ok_or_else(|| IntegrityError::NotAState {
                variable: self.qname(id),
            })?;
        let id = self.states.remove(old);
        self.states.insert(index.min(self.states.len()), id);
        Ok(())
    }

    // ----- bindings and labels ------------------------------------------

    pub fn binding(&self, label: &str) -> Option<VarId> {
        self.all_variables()
            .into_iter()
            .find(|&v| self.var(v).binding() == Some(label))
    }

    pub fn labelled(&self, label: &str) -> Option<VarId> {
        self.all_variables()
            .into_iter()
            .find(|&v| self.var(v).label() == Some(label))
    }

    /// The unique variable bound to "time", if any.
    pub fn time(&self) -> Option<VarId> {
        self.binding("time")
    }

    // ----- classification ----------------------------------------------

    pub fn kind(&self, id: VarId) -> VarKind {
        let var = self.var(id);
        if var.is_state() {
            VarKind::State
        } else if var.is_bound() {
            VarKind::Bound
        } else if self.is_constant(id) {
            VarKind::Constant
        } else {
            VarKind::Intermediary
        }
    }

    /// True if the variable's value is fixed: its equation references,
    /// transitively, nothing but other constants.
    pub fn is_constant(&self, id: VarId) -> bool {
        let mut stack = vec![id];
        let mut seen = vec![id];
        while let Some(v) = stack.pop() {
            let var = self.var(v);
            if var.is_state() || var.is_bound() {
                return false;
            }
            let rhs = match var.rhs() {
                Some(rhs) => rhs,
                None => return false,
            };
            for r in rhs.refs().iter() {
                match r {
                    Ref::Name(t) => {
                        if !seen.contains(t) {
                            seen.push(*t);
                            stack.push(*t);
                        }
                    }
                    _ => return false,
                }
            }
        }
        true
    }

    // ----- naming and resolution ----------------------------------------

    /// Fully qualified dotted name, e.g. `membrane.V` or `ina.gate.alpha`.
    pub fn qname(&self, id: VarId) -> String {
        let comp = self.component(self.var(id).component).name.clone();
        format!("{}.{}", comp, self.local_path(id))
    }

    /// Dotted path relative to the owning component.
    pub fn local_path(&self, id: VarId) -> String {
        let mut parts = vec![self.var(id).name.clone()];
        let mut cursor = self.var(id).parent;
        while let Some(p) = cursor {
            parts.push(self.var(p).name.clone());
            cursor = self.var(p).parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Resolves a plain identifier from a scope: the scope variable's
    /// children, then each ancestor's, then component top-level variables,
    /// then component aliases.
    pub fn resolve(&self, scope: &Scope, name: &str) -> Option<VarId> {
        let mut cursor = scope.variable;
        while let Some(v) = cursor {
            if let Some(&hit) = self
                .var(v)
                .children
                .iter()
                .find(|&&c| self.var(c).name == name)
            {
                return Some(hit);
            }
            if self.var(v).name == name {
                return Some(v);
            }
            cursor = self.var(v).parent;
        }
        if let Some(&hit) = self.components[scope.component.0]
            .vars
            .iter()
            .find(|&&v| self.var(v).name == name)
        {
            return Some(hit);
        }
        self.components[scope.component.0]
            .aliases
            .iter()
            .find(|(alias, _)| alias == name)
            .map(|(_, id)| *id)
    }

    /// Resolves one step of a dotted path below a variable.
    pub fn resolve_nested(&self, parent: VarId, name: &str) -> Option<VarId> {
        self.var(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.var(c).name == name)
    }

    /// Scope-legality rule: a target is visible from a scope if it lives
    /// in the same component and is top-level or anchored on the scope's
    /// nesting chain, or if the scope's component aliases it.
    pub fn visible_from(&self, target: VarId, scope: &Scope) -> bool {
        let tvar = self.var(target);
        if tvar.component == scope.component {
            match tvar.parent {
                None => true,
                Some(parent) => {
                    let mut cursor = scope.variable;
                    while let Some(v) = cursor {
                        if v == parent || v == target {
                            return true;
                        }
                        cursor = self.var(v).parent;
                    }
                    false
                }
            }
        } else {
            self.components[scope.component.0]
                .aliases
                .iter()
                .any(|(_, id)| *id == target)
        }
    }

    // ----- equations and removal ----------------------------------------

    /// Every (owner, expression) pair in the model: right-hand sides and
    /// initial values.
    pub fn all_equations(&self) -> Vec<(VarId, Rc<Expression>)> {
        let mut out = Vec::new();
        for id in self.all_variables() {
            if let Some(rhs) = self.var(id).rhs() {
                out.push((id, Rc::clone(rhs)));
            }
            if let Some(init) = self.var(id).initial() {
                out.push((id, Rc::clone(init)));
            }
        }
        out
    }

    /// Removes a variable. Rejected while any remaining equation still
    /// references it (a removal would leave dangling `Name` nodes).
    pub fn remove_variable(&mut self, id: VarId) -> Result<(), IntegrityError> {
        if !self.var(id).children.is_empty() {
            let child = self.var(id).children[0];
            return Err(IntegrityError::VariableInUse {
                variable: self.qname(id),
                referrer: self.qname(child),
            });
        }
        for (owner, expr) in self.all_equations() {
            if owner == id {
                continue;
            }
            if expr.refs().iter().any(|r| r.var() == id) {
                return Err(IntegrityError::VariableInUse {
                    variable: self.qname(id),
                    referrer: self.qname(owner),
                });
            }
        }
        let component = self.var(id).component;
        let parent = self.var(id).parent;
        match parent {
            Some(p) => self.var_mut(p).children.retain(|&c| c != id),
            None => self.components[component.0].vars.retain(|&v| v != id),
        }
        self.components
            .iter_mut()
            .for_each(|c| c.aliases.retain(|(_, t)| *t != id));
        self.states.retain(|&s| s != id);
        self.vars[id.0] = None;
        Ok(())
    }

    // ----- code emission -------------------------------------------------

    /// Re-emits the whole model as canonical DSL text.
    pub fn code(&self) -> String {
        let mut out = String::from("[[model]]\n");
        out.push_str(&format!("name: {}\n", self.name));
        for &s in &self.states {
            if let Some(init) = self.var(s).initial() {
                out.push_str(&format!("{} = {}\n", self.qname(s), init.code(self, None)));
            }
        }
        for comp_id in self.components() {
            let comp = self.component(comp_id);
            out.push_str(&format!("\n[{}]\n", comp.name()));
            for (alias, target) in comp.aliases() {
                out.push_str(&format!("use {} as {}\n", self.qname(*target), alias));
            }
            let mut stack: Vec<VarId> = comp.variables().iter().rev().copied().collect();
            while let Some(v) = stack.pop() {
                self.write_variable(v, comp_id, &mut out);
                for &child in self.var(v).children().iter().rev() {
                    stack.push(child);
                }
            }
        }
        out
    }

    fn write_variable(&self, v: VarId, comp: CompId, out: &mut String) {
        let var = self.var(v);
        let lhs = if var.is_state() {
            format!("dot({})", self.local_path(v))
        } else {
            self.local_path(v)
        };
        let rhs = match var.rhs() {
            Some(rhs) => rhs.code(self, Some(comp)),
            None => "0".to_string(),
        };
        out.push_str(&format!("{lhs} = {rhs}"));
        if let Some(desc) = var.description() {
            out.push_str(&format!(" : {desc}"));
        }
        out.push('\n');
        if let Some(unit) = var.unit() {
            out.push_str(&format!("    in [{}]\n", self.units.format(&unit)));
        }
        if let Some(binding) = var.binding() {
            out.push_str(&format!("    bind {binding}\n"));
        }
        if let Some(label) = var.label() {
            out.push_str(&format!("    label {label}\n"));
        }
    }
}

fn check_name(name: &str) -> Result<(), IntegrityError> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(IntegrityError::InvalidName {
            name: name.into(),
            detail: "names must match [A-Za-z_][A-Za-z0-9_]*".into(),
        });
    }
    if is_keyword(name) {
        return Err(IntegrityError::InvalidName {
            name: name.into(),
            detail: "name is a reserved keyword".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;

    #[test]
    fn components_and_variables_keep_insertion_order() {
        let mut model = Model::new("m");
        let c = model.add_component("engine").unwrap();
        let a = model.add_variable(c, "a").unwrap();
        let b = model.add_variable(c, "b").unwrap();
        assert_eq!(model.variables(c).collect::<Vec<_>>(), vec![a, b]);
        assert!(model.add_variable(c, "a").is_err());
        assert!(model.add_component("engine").is_err());
        assert!(model.add_variable(c, "1bad").is_err());
        assert!(model.add_variable(c, "and").is_err());
    }

    #[test]
    fn nested_resolution_walks_the_chain() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let top = model.add_variable(c, "top").unwrap();
        let gate = model.add_variable(c, "gate").unwrap();
        let alpha = model.add_nested_variable(gate, "alpha").unwrap();
        let scope = Scope::variable(c, alpha);
        assert_eq!(model.resolve(&scope, "alpha"), Some(alpha));
        assert_eq!(model.resolve(&scope, "gate"), Some(gate));
        assert_eq!(model.resolve(&scope, "top"), Some(top));
        assert_eq!(model.qname(alpha), "c.gate.alpha");
        // alpha is not visible from a sibling top-level scope
        assert!(!model.visible_from(alpha, &Scope::variable(c, top)));
        assert!(model.visible_from(gate, &Scope::variable(c, top)));
    }

    #[test]
    fn removal_is_rejected_while_referenced() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let a = model.add_variable(c, "a").unwrap();
        let b = model.add_variable(c, "b").unwrap();
        model.set_rhs(b, Expression::name(a));
        model.set_rhs(a, Expression::number(1.0, None));
        assert!(matches!(
            model.remove_variable(a),
            Err(IntegrityError::VariableInUse { .. })
        ));
        model.remove_variable(b).unwrap();
        model.remove_variable(a).unwrap();
        assert!(model.variables(c).next().is_none());
    }

    #[test]
    fn state_promotion_and_order() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        let y = model.add_variable(c, "y").unwrap();
        model.promote_to_state(x, Expression::number(0.0, None)).unwrap();
        model.promote_to_state(y, Expression::number(1.0, None)).unwrap();
        assert_eq!(model.states(), &[x, y]);
        model.move_state(y, 0).unwrap();
        assert_eq!(model.states(), &[y, x]);
        assert!(model.promote_to_state(x, Expression::number(0.0, None)).is_err());
        model.demote_state(x).unwrap();
        assert_eq!(model.states(), &[y]);
        assert_eq!(model.kind(y), VarKind::State);
    }

    #[test]
    fn classification_is_transitive() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let k = model.add_variable(c, "k").unwrap();
        let twice = model.add_variable(c, "twice").unwrap();
        let t = model.add_variable(c, "t").unwrap();
        let tracked = model.add_variable(c, "tracked").unwrap();
        model.set_rhs(k, Expression::number(3.0, None));
        model.set_rhs(
            twice,
            Expression::infix(
                crate::expr::InfixOp::Multiply,
                Expression::number(2.0, None),
                Expression::name(k),
            ),
        );
        model.set_rhs(t, Expression::number(0.0, None));
        model.set_binding(t, "time").unwrap();
        model.set_rhs(tracked, Expression::name(t));
        assert_eq!(model.kind(k), VarKind::Constant);
        assert_eq!(model.kind(twice), VarKind::Constant);
        assert_eq!(model.kind(t), VarKind::Bound);
        assert_eq!(model.kind(tracked), VarKind::Intermediary);
        assert_eq!(model.time(), Some(t));
    }
}
