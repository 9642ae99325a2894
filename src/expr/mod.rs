//! The immutable expression tree.
//!
//! Every node is an `Rc<Expression>`: an `ExprKind` plus the set of
//! reference leaves reachable from it (computed once, at construction) and
//! lazily memoized derived data (canonical polish form, hash, per-mode
//! unit result). Nodes never change after construction, so sharing
//! subtrees between expressions is safe and cheap.

use std::cell::OnceCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::error::{IntegrityError, UnitError};
use crate::model::{CompId, Model, VarId};
use crate::units::Unit;
use crate::utils::format_float;

pub mod diff;
pub mod eval;
pub mod unit_eval;

pub use diff::diff;
pub use eval::Precision;

/// A unary prefix operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Plus,
    Minus,
    Not,
}

impl PrefixOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            PrefixOp::Plus => "+",
            PrefixOp::Minus => "-",
            PrefixOp::Not => "not",
        }
    }
}

/// A binary infix operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    /// Integer (floor) division, `//`.
    Quotient,
    /// Remainder with the floor convention, `%`.
    Remainder,
    Power,
    Eq,
    NotEq,
    Less,
    LessEq,
    More,
    MoreEq,
    And,
    Or,
}

impl InfixOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            InfixOp::Plus => "+",
            InfixOp::Minus => "-",
            InfixOp::Multiply => "*",
            InfixOp::Divide => "/",
            InfixOp::Quotient => "//",
            InfixOp::Remainder => "%",
            InfixOp::Power => "^",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::Less => "<",
            InfixOp::LessEq => "<=",
            InfixOp::More => ">",
            InfixOp::MoreEq => ">=",
            InfixOp::And => "and",
            InfixOp::Or => "or",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            InfixOp::Eq
                | InfixOp::NotEq
                | InfixOp::Less
                | InfixOp::LessEq
                | InfixOp::More
                | InfixOp::MoreEq
        )
    }
}

/// A built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sqrt,
    Sin,
    Cos,
    Tan,
    ASin,
    ACos,
    ATan,
    Exp,
    Log,
    Log10,
    Floor,
    Ceil,
    Abs,
}

impl Func {
    pub fn name(&self) -> &'static str {
        match self {
            Func::Sqrt => "sqrt",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::ASin => "asin",
            Func::ACos => "acos",
            Func::ATan => "atan",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Log10 => "log10",
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Abs => "abs",
        }
    }

    pub fn from_name(name: &str) -> Option<Func> {
        Some(match name {
            "sqrt" => Func::Sqrt,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "asin" => Func::ASin,
            "acos" => Func::ACos,
            "atan" => Func::ATan,
            "exp" => Func::Exp,
            "log" => Func::Log,
            "log10" => Func::Log10,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "abs" => Func::Abs,
            _ => return None,
        })
    }

    /// Accepted operand counts; `log` takes a base as optional second
    /// operand, everything else exactly one.
    pub fn arity(&self) -> std::ops::RangeInclusive<usize> {
        match self {
            Func::Log => 1..=2,
            _ => 1..=1,
        }
    }
}

/// A reference leaf: what a node can point at in the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ref {
    Name(VarId),
    Derivative(VarId),
    Initial(VarId),
    Partial(VarId, DiffTarget),
}

impl Ref {
    /// The variable this reference is primarily about.
    pub fn var(&self) -> VarId {
        match self {
            Ref::Name(v) | Ref::Derivative(v) | Ref::Initial(v) | Ref::Partial(v, _) => *v,
        }
    }
}

/// What a partial derivative is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffTarget {
    Name(VarId),
    Initial(VarId),
}

impl DiffTarget {
    pub fn var(&self) -> VarId {
        match self {
            DiffTarget::Name(v) | DiffTarget::Initial(v) => *v,
        }
    }
}

#[derive(Debug)]
pub enum ExprKind {
    Number {
        value: f64,
        unit: Option<Unit>,
    },
    /// Reference to a variable, by arena index.
    Name(VarId),
    /// `dot(x)`: the time derivative of a state.
    Derivative(VarId),
    /// Opaque symbolic partial derivative. Output-only.
    Partial {
        dependent: VarId,
        target: DiffTarget,
    },
    /// A state's initial value. Output-only.
    Initial(VarId),
    Prefix(PrefixOp, Rc<Expression>),
    Infix(InfixOp, Rc<Expression>, Rc<Expression>),
    Function(Func, Vec<Rc<Expression>>),
    If {
        cond: Rc<Expression>,
        then: Rc<Expression>,
        otherwise: Rc<Expression>,
    },
    /// `piecewise(c1, e1, ..., cn, en, default)`: `exprs` holds one more
    /// entry than `conditions`.
    Piecewise {
        conditions: Vec<Rc<Expression>>,
        exprs: Vec<Rc<Expression>>,
    },
}

/// An immutable expression node with precomputed references and memoized
/// derived data. The memo cells are the only mutable state in the tree;
/// they are single-threaded (`Rc`) and write-once (`OnceCell`).
#[derive(Debug)]
pub struct Expression {
    kind: ExprKind,
    refs: BTreeSet<Ref>,
    polish: OnceCell<String>,
    hash: OnceCell<u64>,
    pub(crate) unit_memo: [OnceCell<Result<Option<Unit>, UnitError>>; 2],
}

impl Expression {
    fn make(kind: ExprKind) -> Rc<Expression> {
        let mut refs = BTreeSet::new();
        match &kind {
            ExprKind::Number { .. } => {}
            ExprKind::Name(v) => {
                refs.insert(Ref::Name(*v));
            }
            ExprKind::Derivative(v) => {
                refs.insert(Ref::Derivative(*v));
            }
            ExprKind::Initial(v) => {
                refs.insert(Ref::Initial(*v));
            }
            ExprKind::Partial { dependent, target } => {
                refs.insert(Ref::Partial(*dependent, *target));
            }
            _ => {}
        }
        for child in children_of(&kind) {
            refs.extend(child.refs.iter().copied());
        }
        Rc::new(Expression {
            kind,
            refs,
            polish: OnceCell::new(),
            hash: OnceCell::new(),
            unit_memo: [OnceCell::new(), OnceCell::new()],
        })
    }

    // ----- constructors -------------------------------------------------

    pub fn number(value: f64, unit: Option<Unit>) -> Rc<Expression> {
        Self::make(ExprKind::Number { value, unit })
    }

    pub fn zero(unit: Option<Unit>) -> Rc<Expression> {
        Self::number(0.0, unit)
    }

    pub fn one() -> Rc<Expression> {
        Self::number(1.0, Some(Unit::dimensionless()))
    }

    pub fn name(var: VarId) -> Rc<Expression> {
        Self::make(ExprKind::Name(var))
    }

    pub fn derivative(var: VarId) -> Rc<Expression> {
        Self::make(ExprKind::Derivative(var))
    }

    pub fn initial(var: VarId) -> Rc<Expression> {
        Self::make(ExprKind::Initial(var))
    }

    pub fn partial(dependent: VarId, target: DiffTarget) -> Rc<Expression> {
        Self::make(ExprKind::Partial { dependent, target })
    }

    pub fn prefix(op: PrefixOp, child: Rc<Expression>) -> Rc<Expression> {
        Self::make(ExprKind::Prefix(op, child))
    }

    pub fn infix(op: InfixOp, left: Rc<Expression>, right: Rc<Expression>) -> Rc<Expression> {
        Self::make(ExprKind::Infix(op, left, right))
    }

    /// Builds a function node, checking the operand count. Arity failures
    /// are integrity errors, raised here and not in the parser.
    pub fn function(
        func: Func,
        args: Vec<Rc<Expression>>,
    ) -> Result<Rc<Expression>, IntegrityError> {
        if !func.arity().contains(&args.len()) {
            return Err(IntegrityError::BadArity {
                function: func.name().into(),
                got: args.len(),
            });
        }
        Ok(Self::make(ExprKind::Function(func, args)))
    }

    pub fn if_(
        cond: Rc<Expression>,
        then: Rc<Expression>,
        otherwise: Rc<Expression>,
    ) -> Rc<Expression> {
        Self::make(ExprKind::If {
            cond,
            then,
            otherwise,
        })
    }

    pub fn piecewise(
        conditions: Vec<Rc<Expression>>,
        exprs: Vec<Rc<Expression>>,
    ) -> Result<Rc<Expression>, IntegrityError> {
        if conditions.is_empty() || exprs.len() != conditions.len() + 1 {
            return Err(IntegrityError::BadArity {
                function: "piecewise".into(),
                got: conditions.len() + exprs.len(),
            });
        }
        Ok(Self::make(ExprKind::Piecewise { conditions, exprs }))
    }

    // ----- structure ----------------------------------------------------

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    /// All reference leaves reachable from this node.
    pub fn refs(&self) -> &BTreeSet<Ref> {
        &self.refs
    }

    pub fn depends_on(&self, r: Ref) -> bool {
        self.refs.contains(&r)
    }

    pub fn children(&self) -> Vec<&Rc<Expression>> {
        children_of(&self.kind)
    }

    /// The literal value, if this is a `Number`.
    pub fn as_number(&self) -> Option<f64> {
        match &self.kind {
            ExprKind::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn number_unit(&self) -> Option<Unit> {
        match &self.kind {
            ExprKind::Number { unit, .. } => *unit,
            _ => None,
        }
    }

    /// Pre-order traversal over all sub-expressions, driven by an explicit
    /// work stack rather than recursion.
    pub fn walk(self: &Rc<Expression>) -> Walk {
        Walk {
            stack: vec![Rc::clone(self)],
        }
    }

    // ----- canonical form, equality, hashing ----------------------------

    /// Canonical serialized form: prefix (polish) notation keyed on
    /// variable indices. Two expressions are equal iff their polish forms
    /// are equal; the stable hash is derived from the same string.
    pub fn polish(&self) -> &str {
        self.polish.get_or_init(|| {
            let mut out = String::new();
            self.write_polish(&mut out);
            out
        })
    }

    fn write_polish(&self, out: &mut String) {
        match &self.kind {
            ExprKind::Number { value, unit } => {
                out.push_str(&format!("n:{:016x}", value.to_bits()));
                match unit {
                    Some(u) => out.push_str(&format!("[{}]", u.code())),
                    None => out.push_str("[_]"),
                }
            }
            ExprKind::Name(v) => out.push_str(&format!("v#{}", v.0)),
            ExprKind::Derivative(v) => out.push_str(&format!("d#{}", v.0)),
            ExprKind::Initial(v) => out.push_str(&format!("i#{}", v.0)),
            ExprKind::Partial { dependent, target } => {
                let t = match target {
                    DiffTarget::Name(v) => format!("v#{}", v.0),
                    DiffTarget::Initial(v) => format!("i#{}", v.0),
                };
                out.push_str(&format!("p#{}/{}", dependent.0, t));
            }
            ExprKind::Prefix(op, _) => {
                out.push_str(match op {
                    PrefixOp::Plus => "+u",
                    PrefixOp::Minus => "-u",
                    PrefixOp::Not => "not",
                });
            }
            ExprKind::Infix(op, _, _) => out.push_str(op.symbol()),
            ExprKind::Function(f, args) => {
                out.push_str(f.name());
                if *f == Func::Log {
                    out.push_str(&format!("/{}", args.len()));
                }
            }
            ExprKind::If { .. } => out.push_str("if"),
            ExprKind::Piecewise { conditions, exprs } => {
                out.push_str(&format!("piecewise/{}", conditions.len() + exprs.len()));
            }
        }
        for child in self.children() {
            out.push(' ');
            child.write_polish(out);
        }
    }

    fn chash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            let mut hasher = DefaultHasher::new();
            self.polish().hash(&mut hasher);
            hasher.finish()
        })
    }

    // ----- rendering ----------------------------------------------------

    /// Renders DSL syntax. Variable names are qualified relative to
    /// `context`: local (possibly nested) path for same-component
    /// references, the alias where the context component declares one,
    /// fully qualified otherwise.
    pub fn code(&self, model: &Model, context: Option<CompId>) -> String {
        match &self.kind {
            ExprKind::Number { value, unit } => {
                let mut out = format_float(*value);
                if let Some(u) = unit {
                    out.push_str(&format!(" [{}]", model.units().format(u)));
                }
                out
            }
            ExprKind::Name(v) => render_name(model, *v, context),
            ExprKind::Derivative(v) => {
                format!("dot({})", render_name(model, *v, context))
            }
            ExprKind::Initial(v) => format!("init({})", render_name(model, *v, context)),
            ExprKind::Partial { dependent, target } => {
                let t = match target {
                    DiffTarget::Name(v) => render_name(model, *v, context),
                    DiffTarget::Initial(v) => {
                        format!("init({})", render_name(model, *v, context))
                    }
                };
                format!("partial({}, {})", render_name(model, *dependent, context), t)
            }
            ExprKind::Prefix(op, child) => {
                let inner = if child.rank() < self.rank() {
                    format!("({})", child.code(model, context))
                } else {
                    child.code(model, context)
                };
                match op {
                    PrefixOp::Not => format!("not {inner}"),
                    _ => format!("{}{}", op.symbol(), inner),
                }
            }
            ExprKind::Infix(op, left, right) => {
                let rank = self.rank();
                let is_power = *op == InfixOp::Power;
                let lcode = if left.rank() < rank || (left.rank() == rank && is_power) {
                    format!("({})", left.code(model, context))
                } else {
                    left.code(model, context)
                };
                let rcode = if right.rank() < rank || (right.rank() == rank && !is_power) {
                    format!("({})", right.code(model, context))
                } else {
                    right.code(model, context)
                };
                if is_power {
                    format!("{lcode}^{rcode}")
                } else {
                    format!("{} {} {}", lcode, op.symbol(), rcode)
                }
            }
            ExprKind::Function(f, args) => {
                let args: Vec<_> = args.iter().map(|a| a.code(model, context)).collect();
                format!("{}({})", f.name(), args.join(", "))
            }
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => format!(
                "if({}, {}, {})",
                cond.code(model, context),
                then.code(model, context),
                otherwise.code(model, context)
            ),
            ExprKind::Piecewise { conditions, exprs } => {
                let mut parts = Vec::new();
                for (c, e) in conditions.iter().zip(exprs.iter()) {
                    parts.push(c.code(model, context));
                    parts.push(e.code(model, context));
                }
                parts.push(exprs[exprs.len() - 1].code(model, context));
                format!("piecewise({})", parts.join(", "))
            }
        }
    }

    /// Operator rank used for minimal parenthesization. Higher binds
    /// tighter; atoms and call-like forms are highest.
    fn rank(&self) -> u8 {
        match &self.kind {
            ExprKind::Prefix(PrefixOp::Not, _) => 3,
            ExprKind::Prefix(_, _) => 7,
            ExprKind::Infix(op, _, _) => match op {
                InfixOp::Or => 1,
                InfixOp::And => 2,
                op if op.is_comparison() => 4,
                InfixOp::Plus | InfixOp::Minus => 5,
                InfixOp::Multiply | InfixOp::Divide | InfixOp::Quotient | InfixOp::Remainder => 6,
                InfixOp::Power => 8,
                _ => 4,
            },
            _ => 10,
        }
    }

    // ----- transformation -----------------------------------------------

    /// Returns a new tree with substitutions applied and, optionally,
    /// intermediary variables expanded to their right-hand sides.
    /// Variables listed in `retain`, states and bound variables are never
    /// expanded. Unchanged subtrees are shared, not copied.
    pub fn clone_with(
        self: &Rc<Expression>,
        model: &Model,
        substitutions: Option<&HashMap<Ref, Rc<Expression>>>,
        expand: bool,
        retain: &[VarId],
    ) -> Rc<Expression> {
        if let Some(leaf) = self.as_ref_leaf() {
            if let Some(replacement) = substitutions.and_then(|s| s.get(&leaf)) {
                return Rc::clone(replacement);
            }
            if expand {
                if let Ref::Name(v) = leaf {
                    let var = model.var(v);
                    if !var.is_state() && !var.is_bound() && !retain.contains(&v) {
                        if let Some(rhs) = var.rhs() {
                            return rhs.clone_with(model, substitutions, expand, retain);
                        }
                    }
                }
            }
            return Rc::clone(self);
        }
        let rebuild = |child: &Rc<Expression>| {
            child.clone_with(model, substitutions, expand, retain)
        };
        match &self.kind {
            ExprKind::Number { .. } => Rc::clone(self),
            ExprKind::Prefix(op, child) => {
                let new = rebuild(child);
                if Rc::ptr_eq(&new, child) {
                    Rc::clone(self)
                } else {
                    Expression::prefix(*op, new)
                }
            }
            ExprKind::Infix(op, left, right) => {
                let (l, r) = (rebuild(left), rebuild(right));
                if Rc::ptr_eq(&l, left) && Rc::ptr_eq(&r, right) {
                    Rc::clone(self)
                } else {
                    Expression::infix(*op, l, r)
                }
            }
            ExprKind::Function(f, args) => {
                let new: Vec<_> = args.iter().map(rebuild).collect();
                if new.iter().zip(args).all(|(a, b)| Rc::ptr_eq(a, b)) {
                    Rc::clone(self)
                } else {
                    Expression::make(ExprKind::Function(*f, new))
                }
            }
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                let (c, t, o) = (rebuild(cond), rebuild(then), rebuild(otherwise));
                if Rc::ptr_eq(&c, cond) && Rc::ptr_eq(&t, then) && Rc::ptr_eq(&o, otherwise) {
                    Rc::clone(self)
                } else {
                    Expression::if_(c, t, o)
                }
            }
            ExprKind::Piecewise { conditions, exprs } => {
                let nc: Vec<_> = conditions.iter().map(rebuild).collect();
                let ne: Vec<_> = exprs.iter().map(rebuild).collect();
                let same = nc.iter().zip(conditions).all(|(a, b)| Rc::ptr_eq(a, b))
                    && ne.iter().zip(exprs).all(|(a, b)| Rc::ptr_eq(a, b));
                if same {
                    Rc::clone(self)
                } else {
                    Expression::make(ExprKind::Piecewise {
                        conditions: nc,
                        exprs: ne,
                    })
                }
            }
            // leaves handled above
            _ => Rc::clone(self),
        }
    }

    fn as_ref_leaf(&self) -> Option<Ref> {
        match &self.kind {
            ExprKind::Name(v) => Some(Ref::Name(*v)),
            ExprKind::Derivative(v) => Some(Ref::Derivative(*v)),
            ExprKind::Initial(v) => Some(Ref::Initial(*v)),
            ExprKind::Partial { dependent, target } => Some(Ref::Partial(*dependent, *target)),
            _ => None,
        }
    }
}

fn children_of(kind: &ExprKind) -> Vec<&Rc<Expression>> {
    match kind {
        ExprKind::Number { .. }
        | ExprKind::Name(_)
        | ExprKind::Derivative(_)
        | ExprKind::Partial { .. }
        | ExprKind::Initial(_) => Vec::new(),
        ExprKind::Prefix(_, child) => vec![child],
        ExprKind::Infix(_, left, right) => vec![left, right],
        ExprKind::Function(_, args) => args.iter().collect(),
        ExprKind::If {
            cond,
            then,
            otherwise,
        } => vec![cond, then, otherwise],
        ExprKind::Piecewise { conditions, exprs } => {
            conditions.iter().chain(exprs.iter()).collect()
        }
    }
}

fn render_name(model: &Model, var: VarId, context: Option<CompId>) -> String {
    let owner = model.var(var).component();
    match context {
        Some(ctx) if ctx == owner => model.local_path(var),
        Some(ctx) => {
            let alias = model
                .component(ctx)
                .aliases()
                .iter()
                .find(|(_, target)| *target == var)
                .map(|(name, _)| name.clone());
            alias.unwrap_or_else(|| model.qname(var))
        }
        None => model.qname(var),
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.polish() == other.polish()
    }
}

impl Eq for Expression {}

impl Hash for Expression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.chash());
    }
}

/// Pre-order iterator over sub-expressions (explicit work stack).
pub struct Walk {
    stack: Vec<Rc<Expression>>,
}

impl Iterator for Walk {
    type Item = Rc<Expression>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children().into_iter().rev() {
            self.stack.push(Rc::clone(child));
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    fn two_vars() -> (Model, VarId, VarId) {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        let y = model.add_variable(c, "y").unwrap();
        (model, x, y)
    }

    #[test]
    fn refs_union_children() {
        let (_, x, y) = two_vars();
        let e = Expression::infix(
            InfixOp::Plus,
            Expression::name(x),
            Expression::infix(InfixOp::Multiply, Expression::name(y), Expression::derivative(x)),
        );
        let refs: Vec<_> = e.refs().iter().copied().collect();
        assert_eq!(refs, vec![Ref::Name(x), Ref::Name(y), Ref::Derivative(x)]);
    }

    #[test]
    fn equality_is_structural_and_identity_keyed() {
        let (_, x, y) = two_vars();
        let a = Expression::infix(InfixOp::Plus, Expression::name(x), Expression::one());
        let b = Expression::infix(InfixOp::Plus, Expression::name(x), Expression::one());
        let c = Expression::infix(InfixOp::Plus, Expression::name(y), Expression::one());
        assert_eq!(a, b);
        assert_ne!(a, c);
        let hash = |e: &Expression| {
            let mut h = DefaultHasher::new();
            e.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn number_units_participate_in_equality() {
        let mv = crate::units::UnitRegistry::si().lookup("mV");
        let a = Expression::number(5.0, mv);
        let b = Expression::number(5.0, mv);
        let c = Expression::number(5.0, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn walk_is_preorder() {
        let (_, x, y) = two_vars();
        let e = Expression::infix(
            InfixOp::Minus,
            Expression::name(x),
            Expression::prefix(PrefixOp::Minus, Expression::name(y)),
        );
        let kinds: Vec<String> = e
            .walk()
            .map(|n| match n.kind() {
                ExprKind::Infix(op, _, _) => op.symbol().to_string(),
                ExprKind::Prefix(op, _) => format!("u{}", op.symbol()),
                ExprKind::Name(_) => "name".to_string(),
                _ => "?".to_string(),
            })
            .collect();
        assert_eq!(kinds, vec!["-", "name", "u-", "name"]);
    }

    #[test]
    fn code_uses_minimal_parentheses() {
        let (model, x, y) = two_vars();
        let ctx = model.component_by_name("c");
        let e = Expression::infix(
            InfixOp::Multiply,
            Expression::infix(InfixOp::Plus, Expression::name(x), Expression::name(y)),
            Expression::number(2.0, None),
        );
        assert_eq!(e.code(&model, ctx), "(x + y) * 2");
        let p = Expression::infix(
            InfixOp::Power,
            Expression::name(x),
            Expression::infix(InfixOp::Power, Expression::name(y), Expression::number(2.0, None)),
        );
        assert_eq!(p.code(&model, ctx), "x^y^2");
        let q = Expression::infix(
            InfixOp::Power,
            Expression::infix(InfixOp::Power, Expression::name(x), Expression::name(y)),
            Expression::number(2.0, None),
        );
        assert_eq!(q.code(&model, ctx), "(x^y)^2");
        let n = Expression::prefix(
            PrefixOp::Minus,
            Expression::infix(InfixOp::Power, Expression::name(x), Expression::number(2.0, None)),
        );
        assert_eq!(n.code(&model, ctx), "-x^2");
    }

    #[test]
    fn cross_component_rendering_prefers_aliases() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let d = model.add_component("d").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        let e = Expression::name(x);
        assert_eq!(e.code(&model, Some(d)), "c.x");
        assert_eq!(e.code(&model, None), "c.x");
        model.add_alias(d, "cx", x).unwrap();
        assert_eq!(e.code(&model, Some(d)), "cx");
        assert_eq!(e.code(&model, Some(c)), "x");
    }

    #[test]
    fn clone_with_expands_intermediaries_but_not_states() {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let k = model.add_variable(c, "k").unwrap();
        let s = model.add_variable(c, "s").unwrap();
        let e = model.add_variable(c, "e").unwrap();
        model.set_rhs(k, Expression::number(3.0, None));
        model.set_rhs(s, Expression::name(k));
        model.promote_to_state(s, Expression::number(0.0, None)).unwrap();
        model.set_rhs(
            e,
            Expression::infix(InfixOp::Plus, Expression::name(k), Expression::name(s)),
        );
        let rhs = Rc::clone(model.var(e).rhs().unwrap());
        let expanded = rhs.clone_with(&model, None, true, &[]);
        assert_eq!(
            expanded,
            Expression::infix(InfixOp::Plus, Expression::number(3.0, None), Expression::name(s))
        );
        // retained variables stay as references
        let kept = rhs.clone_with(&model, None, true, &[k]);
        assert!(Rc::ptr_eq(&kept, &rhs));
        // substitution wins over expansion
        let subst: HashMap<Ref, Rc<Expression>> =
            [(Ref::Name(k), Expression::number(9.0, None))].into();
        let substituted = rhs.clone_with(&model, Some(&subst), false, &[]);
        assert_eq!(
            substituted,
            Expression::infix(InfixOp::Plus, Expression::number(9.0, None), Expression::name(s))
        );
    }
}
