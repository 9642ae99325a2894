//! Pratt expression parser and the line-oriented model reader.
//!
//! Expressions are parsed with precedence climbing; names are resolved
//! against the live symbol table as they are read, so an unresolved
//! reference fails at its exact source position. Models are read in two
//! passes: the first declares components, variables and aliases, the
//! second parses right-hand sides, so forward references are legal.

use std::collections::HashSet;
use std::iter::Peekable;
use std::rc::Rc;

use crate::error::{IntegrityError, ParseError};
use crate::expr::{Expression, Func, InfixOp, PrefixOp};
use crate::model::{CompId, Model, Scope, VarId};
use crate::units::Unit;

use super::tokenizer::{Token, TokenKind, Tokenizer};

const BP_OR: u8 = 10;
const BP_AND: u8 = 20;
const BP_NOT: u8 = 30;
const BP_CMP: u8 = 40;
const BP_ADD: u8 = 50;
const BP_MUL: u8 = 60;
const BP_PREFIX: u8 = 70;
const BP_POWER: u8 = 80;

/// Parses a standalone expression against a model scope.
pub fn parse_expression(
    text: &str,
    model: &Model,
    scope: &Scope,
) -> Result<Rc<Expression>, ParseError> {
    parse_expression_at(text, 1, 0, model, scope)
}

fn parse_expression_at(
    text: &str,
    line: usize,
    col: usize,
    model: &Model,
    scope: &Scope,
) -> Result<Rc<Expression>, ParseError> {
    let mut parser = ExprParser {
        tokens: Tokenizer::at(text, line, col).peekable(),
        model,
        scope: *scope,
        line,
        col,
    };
    let expr = parser.parse_bp(0)?;
    if let Some(tok) = parser.peek()? {
        return Err(ExprParser::unexpected(tok, "end of expression"));
    }
    Ok(expr)
}

struct ExprParser<'a> {
    tokens: Peekable<Tokenizer<'a>>,
    model: &'a Model,
    scope: Scope,
    /// Position just past the last consumed token, for end-of-input errors.
    line: usize,
    col: usize,
}

fn infix_power(tok: &Token) -> Option<(InfixOp, u8)> {
    Some(match tok.kind {
        TokenKind::Plus => (InfixOp::Plus, BP_ADD),
        TokenKind::Minus => (InfixOp::Minus, BP_ADD),
        TokenKind::Star => (InfixOp::Multiply, BP_MUL),
        TokenKind::Slash => (InfixOp::Divide, BP_MUL),
        TokenKind::SlashSlash => (InfixOp::Quotient, BP_MUL),
        TokenKind::Percent => (InfixOp::Remainder, BP_MUL),
        TokenKind::Caret => (InfixOp::Power, BP_POWER),
        TokenKind::Eq => (InfixOp::Eq, BP_CMP),
        TokenKind::NotEq => (InfixOp::NotEq, BP_CMP),
        TokenKind::Less => (InfixOp::Less, BP_CMP),
        TokenKind::LessEq => (InfixOp::LessEq, BP_CMP),
        TokenKind::More => (InfixOp::More, BP_CMP),
        TokenKind::MoreEq => (InfixOp::MoreEq, BP_CMP),
        TokenKind::Keyword => match tok.text.as_str() {
            "and" => (InfixOp::And, BP_AND),
            "or" => (InfixOp::Or, BP_OR),
            _ => return None,
        },
        _ => return None,
    })
}

impl<'a> ExprParser<'a> {
    fn peek(&mut self) -> Result<Option<&Token>, ParseError> {
        match self.tokens.peek() {
            None => Ok(None),
            Some(Ok(tok)) => Ok(Some(tok)),
            Some(Err(err)) => Err(err.clone()),
        }
    }

    fn advance(&mut self) -> Result<Option<Token>, ParseError> {
        match self.tokens.next() {
            None => Ok(None),
            Some(Ok(tok)) => {
                self.line = tok.line;
                self.col = tok.col + tok.text.chars().count();
                Ok(Some(tok))
            }
            Some(Err(err)) => Err(err),
        }
    }

    fn must(&mut self, what: &str) -> Result<Token, ParseError> {
        self.advance()?.ok_or_else(|| {
            ParseError::new(
                "Syntax error",
                self.line,
                self.col,
                format!("expected {what}, found end of input"),
            )
        })
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let tok = self.must(what)?;
        if tok.kind != kind {
            return Err(Self::unexpected(&tok, what));
        }
        Ok(tok)
    }

    fn unexpected(tok: &Token, what: &str) -> ParseError {
        ParseError::new(
            "Syntax error",
            tok.line,
            tok.col,
            format!("expected {what}, found '{}'", tok.text),
        )
        .with_span(tok.text.chars().count())
    }

    fn parse_bp(&mut self, min_bp: u8) -> Result<Rc<Expression>, ParseError> {
        let mut lhs = self.parse_primary()?;
        while let Some(tok) = self.peek()? {
            let (op, lbp) = match infix_power(tok) {
                Some(found) => found,
                None => break,
            };
            if lbp < min_bp {
                break;
            }
            self.advance()?;
            // ^ is right-associative, everything else left
            let rbp = if op == InfixOp::Power { lbp } else { lbp + 1 };
            let rhs = self.parse_bp(rbp)?;
            lhs = Expression::infix(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Rc<Expression>, ParseError> {
        let tok = self.must("an expression")?;
        match tok.kind {
            TokenKind::Number => self.parse_number(tok),
            TokenKind::Plus => Ok(Expression::prefix(PrefixOp::Plus, self.parse_bp(BP_PREFIX)?)),
            TokenKind::Minus => {
                let operand = self.parse_bp(BP_PREFIX)?;
                // fold a negated literal so code() round-trips exactly
                match operand.as_number() {
                    Some(value) => Ok(Expression::number(-value, operand.number_unit())),
                    None => Ok(Expression::prefix(PrefixOp::Minus, operand)),
                }
            }
            TokenKind::LParen => {
                let inner = self.parse_bp(0)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Keyword => match tok.text.as_str() {
                "not" => Ok(Expression::prefix(PrefixOp::Not, self.parse_bp(BP_NOT)?)),
                "if" => self.parse_if(&tok),
                "piecewise" => self.parse_piecewise(&tok),
                "dot" => {
                    self.expect(TokenKind::LParen, "'(' after dot")?;
                    let name = self.expect(TokenKind::Ident, "a variable name")?;
                    let var = self.resolve_path(name)?;
                    self.expect(TokenKind::RParen, "')'")?;
                    Ok(Expression::derivative(var))
                }
                _ => Err(Self::unexpected(&tok, "an expression")),
            },
            TokenKind::Ident => {
                if matches!(self.peek()?, Some(t) if t.kind == TokenKind::LParen) {
                    self.parse_call(tok)
                } else {
                    Ok(Expression::name(self.resolve_path(tok)?))
                }
            }
            _ => Err(Self::unexpected(&tok, "an expression")),
        }
    }

    fn parse_number(&mut self, tok: Token) -> Result<Rc<Expression>, ParseError> {
        let value: f64 = tok.text.parse().map_err(|_| {
            ParseError::new(
                "Syntax error",
                tok.line,
                tok.col,
                format!("invalid number '{}'", tok.text),
            )
            .with_span(tok.text.chars().count())
        })?;
        let unit = if matches!(self.peek()?, Some(t) if t.kind == TokenKind::LBracket) {
            let open = self.must("'['")?;
            Some(self.parse_unit_literal(&open)?)
        } else {
            None
        };
        Ok(Expression::number(value, unit))
    }

    fn parse_unit_literal(&mut self, open: &Token) -> Result<Unit, ParseError> {
        let mut text = String::new();
        loop {
            let tok = self.must("']' to close the unit")?;
            if tok.kind == TokenKind::RBracket {
                break;
            }
            text.push_str(&tok.text);
        }
        self.model.units().parse(&text).map_err(|err| {
            ParseError::new("Unit error", open.line, open.col, err.message)
                .with_span(text.chars().count() + 2)
        })
    }

    fn parse_call(&mut self, tok: Token) -> Result<Rc<Expression>, ParseError> {
        let func = Func::from_name(&tok.text).ok_or_else(|| {
            ParseError::new(
                "Unresolved reference",
                tok.line,
                tok.col,
                format!("unknown function '{}'", tok.text),
            )
            .with_span(tok.text.chars().count())
        })?;
        self.expect(TokenKind::LParen, "'('")?;
        let args = self.parse_args()?;
        Expression::function(func, args).map_err(|cause| {
            ParseError::new(
                "Invalid function call",
                tok.line,
                tok.col,
                format!("bad call to {}()", tok.text),
            )
            .with_span(tok.text.chars().count())
            .with_cause(cause)
        })
    }

    fn parse_if(&mut self, tok: &Token) -> Result<Rc<Expression>, ParseError> {
        self.expect(TokenKind::LParen, "'(' after if")?;
        let args = self.parse_args()?;
        let got = args.len();
        let mut it = args.into_iter();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(cond), Some(then), Some(otherwise), None) => {
                Ok(Expression::if_(cond, then, otherwise))
            }
            _ => Err(ParseError::new(
                "Invalid function call",
                tok.line,
                tok.col,
                "if() takes a condition and two branches",
            )
            .with_span(2)
            .with_cause(IntegrityError::BadArity {
                function: "if".into(),
                got,
            })),
        }
    }

    fn parse_piecewise(&mut self, tok: &Token) -> Result<Rc<Expression>, ParseError> {
        self.expect(TokenKind::LParen, "'(' after piecewise")?;
        let mut args = self.parse_args()?;
        let got = args.len();
        let bad = |cause: IntegrityError| {
            ParseError::new(
                "Invalid function call",
                tok.line,
                tok.col,
                "piecewise() takes condition/value pairs and a default",
            )
            .with_span(tok.text.chars().count())
            .with_cause(cause)
        };
        if got < 3 || got % 2 == 0 {
            return Err(bad(IntegrityError::BadArity {
                function: "piecewise".into(),
                got,
            }));
        }
        let default = match args.pop() {
            Some(default) => default,
            None => {
                return Err(bad(IntegrityError::BadArity {
                    function: "piecewise".into(),
                    got,
                }))
            }
        };
        let mut conditions = Vec::new();
        let mut exprs = Vec::new();
        for (i, arg) in args.into_iter().enumerate() {
            if i % 2 == 0 {
                conditions.push(arg);
            } else {
                exprs.push(arg);
            }
        }
        exprs.push(default);
        Expression::piecewise(conditions, exprs).map_err(bad)
    }

    /// Arguments of a call whose `(` was already consumed.
    fn parse_args(&mut self) -> Result<Vec<Rc<Expression>>, ParseError> {
        let mut args = Vec::new();
        if matches!(self.peek()?, Some(t) if t.kind == TokenKind::RParen) {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.parse_bp(0)?);
            let tok = self.must("',' or ')'")?;
            match tok.kind {
                TokenKind::Comma => continue,
                TokenKind::RParen => break,
                _ => return Err(Self::unexpected(&tok, "',' or ')'")),
            }
        }
        Ok(args)
    }

    /// A possibly dotted name, resolved against the current scope first
    /// and as a fully qualified `component.variable` path second.
    fn resolve_path(&mut self, first: Token) -> Result<VarId, ParseError> {
        let mut parts = vec![first.text.clone()];
        while matches!(self.peek()?, Some(t) if t.kind == TokenKind::Dot) {
            self.advance()?;
            let part = self.expect(TokenKind::Ident, "a name after '.'")?;
            parts.push(part.text);
        }
        self.resolve_parts(&parts).ok_or_else(|| {
            let path = parts.join(".");
            ParseError::new(
                "Unresolved reference",
                first.line,
                first.col,
                format!("unknown variable '{path}'"),
            )
            .with_span(path.chars().count())
        })
    }

    fn resolve_parts(&self, parts: &[String]) -> Option<VarId> {
        if let Some(anchor) = self.model.resolve(&self.scope, &parts[0]) {
            let mut var = Some(anchor);
            for part in &parts[1..] {
                var = var.and_then(|v| self.model.resolve_nested(v, part));
            }
            if let Some(var) = var {
                return Some(var);
            }
        }
        if parts.len() >= 2 {
            let comp = self.model.component_by_name(&parts[0])?;
            let mut var = self
                .model
                .variables(comp)
                .find(|&v| self.model.var(v).name() == parts[1])?;
            for part in &parts[2..] {
                var = self.model.resolve_nested(var, part)?;
            }
            return Some(var);
        }
        None
    }
}

// ----- model reader ------------------------------------------------------

struct PendingRhs {
    var: VarId,
    comp: CompId,
    text: String,
    line: usize,
    col: usize,
    is_dot: bool,
}

struct PendingInit {
    path: String,
    path_col: usize,
    text: String,
    line: usize,
    col: usize,
}

struct PendingAlias {
    comp: CompId,
    path: String,
    alias: String,
    line: usize,
}

enum Section {
    Start,
    ModelHead,
    Component(CompId),
}

/// Character column of a sub-slice within its source line.
fn col_in(raw: &str, sub: &str) -> usize {
    let offset = sub.as_ptr() as usize - raw.as_ptr() as usize;
    raw[..offset].chars().count()
}

fn find_assign(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, c) in text.char_indices() {
        if c != '=' {
            continue;
        }
        if matches!(text[..i].chars().last(), Some('=' | '!' | '<' | '>')) {
            continue;
        }
        if bytes.get(i + 1) == Some(&b'=') {
            continue;
        }
        return Some(i);
    }
    None
}

fn integrity(line: usize, col: usize, detail: String, cause: IntegrityError) -> ParseError {
    ParseError::new("Integrity error", line, col, detail).with_cause(cause)
}

/// Reads a complete model from DSL text.
pub fn parse_model(source: &str) -> Result<Model, ParseError> {
    let mut model = Model::new("model");
    let mut section = Section::Start;
    let mut pending: Vec<PendingRhs> = Vec::new();
    let mut initials: Vec<PendingInit> = Vec::new();
    let mut aliases: Vec<PendingAlias> = Vec::new();
    let mut last_var: Option<VarId> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let code = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        if code.trim().is_empty() {
            continue;
        }
        let text = code.trim();
        if code.starts_with(' ') || code.starts_with('\t') {
            let var = match (&section, last_var) {
                (Section::Component(_), Some(var)) => var,
                _ => {
                    return Err(ParseError::new(
                        "Syntax error",
                        line_no,
                        col_in(raw, text),
                        "indented clause without a preceding variable",
                    ))
                }
            };
            apply_clause(&mut model, var, text, line_no, col_in(raw, text))?;
            continue;
        }
        if let Some(header) = text.strip_prefix("[[") {
            let name = header.strip_suffix("]]").map(str::trim);
            if name != Some("model") {
                return Err(ParseError::new(
                    "Syntax error",
                    line_no,
                    0,
                    "expected a [[model]] header",
                ));
            }
            if !matches!(section, Section::Start) {
                return Err(ParseError::new(
                    "Syntax error",
                    line_no,
                    0,
                    "duplicate [[model]] header",
                ));
            }
            section = Section::ModelHead;
            continue;
        }
        if let Some(header) = text.strip_prefix('[') {
            if matches!(section, Section::Start) {
                return Err(ParseError::new(
                    "Syntax error",
                    line_no,
                    0,
                    "expected a [[model]] header before components",
                ));
            }
            let name = header.strip_suffix(']').map(str::trim).ok_or_else(|| {
                ParseError::new(
                    "Syntax error",
                    line_no,
                    text.chars().count().saturating_sub(1),
                    "expected ']' at the end of a component header",
                )
            })?;
            let comp = model.add_component(name).map_err(|cause| {
                integrity(
                    line_no,
                    1,
                    format!("cannot declare component '{name}'"),
                    cause,
                )
            })?;
            section = Section::Component(comp);
            last_var = None;
            continue;
        }
        match section {
            Section::Start => {
                return Err(ParseError::new(
                    "Syntax error",
                    line_no,
                    0,
                    "expected a [[model]] header",
                ))
            }
            Section::ModelHead => {
                if let Some(eq) = find_assign(text) {
                    let lhs = text[..eq].trim();
                    let rhs = text[eq + 1..].trim();
                    initials.push(PendingInit {
                        path: lhs.to_string(),
                        path_col: col_in(raw, lhs),
                        text: rhs.to_string(),
                        line: line_no,
                        col: col_in(raw, rhs),
                    });
                } else if let Some((key, value)) = text.split_once(':') {
                    match key.trim() {
                        "name" => {
                            model.set_name(value.trim()).map_err(|cause| {
                                integrity(line_no, 0, "invalid model name".into(), cause)
                            })?;
                        }
                        other => {
                            return Err(ParseError::new(
                                "Syntax error",
                                line_no,
                                0,
                                format!("unknown model property '{other}'"),
                            ))
                        }
                    }
                } else {
                    return Err(ParseError::new(
                        "Syntax error",
                        line_no,
                        0,
                        "expected 'name:' or an initial value line",
                    ));
                }
            }
            Section::Component(comp) => {
                if let Some(rest) = text.strip_prefix("use ") {
                    let words: Vec<&str> = rest.split_whitespace().collect();
                    match words.as_slice() {
                        [path, "as", alias] => aliases.push(PendingAlias {
                            comp,
                            path: path.to_string(),
                            alias: alias.to_string(),
                            line: line_no,
                        }),
                        _ => {
                            return Err(ParseError::new(
                                "Syntax error",
                                line_no,
                                col_in(raw, rest),
                                "expected 'use component.variable as name'",
                            ))
                        }
                    }
                    continue;
                }
                let (code_part, desc) = match text.split_once(':') {
                    Some((head, tail)) => (head.trim_end(), Some(tail.trim())),
                    None => (text, None),
                };
                let eq = find_assign(code_part).ok_or_else(|| {
                    ParseError::new(
                        "Syntax error",
                        line_no,
                        col_in(raw, code_part),
                        "expected '=' in a variable definition",
                    )
                })?;
                let lhs = code_part[..eq].trim();
                let rhs = code_part[eq + 1..].trim();
                let (var, is_dot) = define_variable(&mut model, comp, lhs, line_no, raw)?;
                if let Some(desc) = desc {
                    if !desc.is_empty() {
                        model.set_description(var, desc);
                    }
                }
                pending.push(PendingRhs {
                    var,
                    comp,
                    text: rhs.to_string(),
                    line: line_no,
                    col: col_in(raw, rhs),
                    is_dot,
                });
                last_var = Some(var);
            }
        }
    }

    for alias in &aliases {
        let target = resolve_qualified(&model, &alias.path).ok_or_else(|| {
            ParseError::new(
                "Unresolved reference",
                alias.line,
                0,
                format!("unknown variable '{}'", alias.path),
            )
        })?;
        model
            .add_alias(alias.comp, &alias.alias, target)
            .map_err(|cause| {
                integrity(
                    alias.line,
                    0,
                    format!("cannot create alias '{}'", alias.alias),
                    cause,
                )
            })?;
    }

    // second pass: right-hand sides against the fully populated table
    let dot_vars: HashSet<VarId> = pending.iter().filter(|p| p.is_dot).map(|p| p.var).collect();
    for p in &pending {
        let scope = Scope::variable(p.comp, p.var);
        let rhs = parse_expression_at(&p.text, p.line, p.col, &model, &scope)?;
        model.set_rhs(p.var, rhs);
    }

    let mut initialized: HashSet<VarId> = HashSet::new();
    for init in &initials {
        let var = resolve_qualified(&model, &init.path).ok_or_else(|| {
            ParseError::new(
                "Unresolved reference",
                init.line,
                init.path_col,
                format!("unknown variable '{}'", init.path),
            )
            .with_span(init.path.chars().count())
        })?;
        if !dot_vars.contains(&var) {
            return Err(integrity(
                init.line,
                init.path_col,
                format!("'{}' has no dot() equation", init.path),
                IntegrityError::NotAState {
                    variable: model.qname(var),
                },
            )
            .with_span(init.path.chars().count()));
        }
        let scope = Scope::variable(model.var(var).component(), var);
        let value = parse_expression_at(&init.text, init.line, init.col, &model, &scope)?;
        if value.as_number().is_none() {
            return Err(ParseError::new(
                "Syntax error",
                init.line,
                init.col,
                "an initial value must be a number literal",
            )
            .with_span(init.text.chars().count()));
        }
        model.promote_to_state(var, value).map_err(|cause| {
            integrity(
                init.line,
                init.path_col,
                format!("cannot set initial value of '{}'", init.path),
                cause,
            )
        })?;
        initialized.insert(var);
    }
    for p in &pending {
        if p.is_dot && !initialized.contains(&p.var) {
            let name = model.qname(p.var);
            return Err(integrity(
                p.line,
                0,
                format!("state '{name}' has no initial value"),
                IntegrityError::MissingInitialValue { variable: name },
            ));
        }
    }
    log::debug!(
        "parsed model '{}': {} components, {} states",
        model.name(),
        model.components().count(),
        model.states().len()
    );
    Ok(model)
}

/// Creates the variable a definition line introduces: `name`, `dot(name)`
/// or `parent.child` for a nested variable under an existing parent.
fn define_variable(
    model: &mut Model,
    comp: CompId,
    lhs: &str,
    line: usize,
    raw: &str,
) -> Result<(VarId, bool), ParseError> {
    let col = col_in(raw, lhs);
    if let Some(inner) = lhs.strip_prefix("dot(") {
        let name = inner.strip_suffix(')').map(str::trim).ok_or_else(|| {
            ParseError::new("Syntax error", line, col, "expected ')' after dot(name")
        })?;
        let var = declare(model, comp, name, line, col)?;
        return Ok((var, true));
    }
    let var = declare(model, comp, lhs, line, col)?;
    Ok((var, false))
}

/// Declares `name` (plain) or `parent.child` (nested under an already
/// declared parent) in a component.
fn declare(
    model: &mut Model,
    comp: CompId,
    name: &str,
    line: usize,
    col: usize,
) -> Result<VarId, ParseError> {
    if let Some((parent_path, leaf)) = name.rsplit_once('.') {
        let mut cursor: Option<VarId> = None;
        for part in parent_path.split('.') {
            cursor = match cursor {
                None => model.variables(comp).find(|&v| model.var(v).name() == part),
                Some(parent) => model.resolve_nested(parent, part),
            };
            if cursor.is_none() {
                return Err(ParseError::new(
                    "Unresolved reference",
                    line,
                    col,
                    format!("unknown parent variable '{parent_path}'"),
                )
                .with_span(parent_path.chars().count()));
            }
        }
        let parent = cursor.ok_or_else(|| {
            ParseError::new("Syntax error", line, col, "expected a parent variable")
        })?;
        return model.add_nested_variable(parent, leaf.trim()).map_err(|cause| {
            integrity(line, col, format!("cannot declare '{name}'"), cause)
        });
    }
    model
        .add_variable(comp, name)
        .map_err(|cause| integrity(line, col, format!("cannot declare '{name}'"), cause))
}

fn apply_clause(
    model: &mut Model,
    var: VarId,
    text: &str,
    line: usize,
    col: usize,
) -> Result<(), ParseError> {
    if let Some(rest) = text.strip_prefix("in ") {
        let inner = rest
            .trim()
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(|| {
                ParseError::new(
                    "Syntax error",
                    line,
                    col,
                    "expected a bracketed unit, e.g. 'in [mV]'",
                )
            })?;
        let unit = model.units().parse(inner).map_err(|err| {
            ParseError::new("Unit error", line, col, err.message)
                .with_span(text.chars().count())
        })?;
        model.set_unit(var, unit);
        Ok(())
    } else if let Some(label) = text.strip_prefix("bind ") {
        let label = label.trim();
        model.set_binding(var, label).map_err(|cause| {
            integrity(line, col, format!("cannot bind '{label}'"), cause)
        })
    } else if let Some(label) = text.strip_prefix("label ") {
        let label = label.trim();
        model.set_label(var, label).map_err(|cause| {
            integrity(line, col, format!("cannot label '{label}'"), cause)
        })
    } else if let Some(desc) = text.strip_prefix(':') {
        model.set_description(var, desc.trim());
        Ok(())
    } else {
        Err(ParseError::new(
            "Syntax error",
            line,
            col,
            format!("unknown clause '{text}'"),
        ))
    }
}

/// `component.variable[.nested...]`, components only at the first step.
fn resolve_qualified(model: &Model, path: &str) -> Option<VarId> {
    let mut it = path.split('.');
    let comp = model.component_by_name(it.next()?)?;
    let top = it.next()?;
    let mut var = model.variables(comp).find(|&v| model.var(v).name() == top)?;
    for part in it {
        var = model.resolve_nested(var, part)?;
    }
    Some(var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprKind;

    fn fixture() -> (Model, Scope) {
        let mut model = Model::new("m");
        let c = model.add_component("c").unwrap();
        let x = model.add_variable(c, "x").unwrap();
        model.add_variable(c, "y").unwrap();
        let gate = model.add_variable(c, "gate").unwrap();
        model.add_nested_variable(gate, "alpha").unwrap();
        let d = model.add_component("d").unwrap();
        model.add_variable(d, "z").unwrap();
        model.promote_to_state(x, Expression::number(0.0, None)).unwrap();
        (model, Scope::component(c))
    }

    fn parse(text: &str, model: &Model, scope: &Scope) -> Rc<Expression> {
        parse_expression(text, model, scope).unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        let (model, scope) = fixture();
        let ctx = Some(scope.component);
        let e = parse("1 + 2 * x ^ 2 ^ y", &model, &scope);
        assert_eq!(e.code(&model, ctx), "1 + 2 * x^2^y");
        let e = parse("-x^2", &model, &scope);
        assert_eq!(e.code(&model, ctx), "-x^2");
        // unary minus binds tighter than multiplication
        let e = parse("-x * y", &model, &scope);
        assert_eq!(e.code(&model, ctx), "-x * y");
        let e = parse("not x < 2 and y > 1 or x == y", &model, &scope);
        assert_eq!(e.code(&model, ctx), "not x < 2 and y > 1 or x == y");
    }

    #[test]
    fn round_trip_through_code() {
        let (model, scope) = fixture();
        let ctx = Some(scope.component);
        for text in [
            "(x + y) * 2",
            "x // 3 % y",
            "5 [mV] / 2 [ms]",
            "if(x < 1, sin(x), cos(y))",
            "piecewise(x < 1, 1, x < 2, 2, 3)",
            "dot(x) + log(x, 10)",
            "-2.5e-17 * x",
            "d.z + gate.alpha",
        ] {
            let e = parse(text, &model, &scope);
            let again = parse(&e.code(&model, ctx), &model, &scope);
            assert_eq!(e, again, "{text}");
        }
    }

    #[test]
    fn negative_literals_fold() {
        let (model, scope) = fixture();
        let e = parse("-80 [mV]", &model, &scope);
        assert_eq!(e.as_number(), Some(-80.0));
        assert_eq!(e.number_unit(), model.units().lookup("mV"));
        // -x^2 must stay -(x^2), not (-x)^2
        let e = parse("-2^2", &model, &scope);
        assert!(matches!(e.kind(), ExprKind::Prefix(PrefixOp::Minus, _)));
    }

    #[test]
    fn unresolved_reference_is_positioned() {
        let (model, scope) = fixture();
        let err = parse_expression("x + missing * 2", &model, &scope).unwrap_err();
        assert_eq!(err.name, "Unresolved reference");
        assert_eq!(err.line, 1);
        assert_eq!(err.col, 4);
        assert_eq!(err.span, 7);
    }

    #[test]
    fn arity_errors_carry_a_cause() {
        let (model, scope) = fixture();
        let err = parse_expression("sqrt(x, y)", &model, &scope).unwrap_err();
        assert_eq!(err.name, "Invalid function call");
        assert!(matches!(
            err.cause.as_deref(),
            Some(IntegrityError::BadArity { got: 2, .. })
        ));
        let err = parse_expression("piecewise(x < 1, 2)", &model, &scope).unwrap_err();
        assert!(matches!(
            err.cause.as_deref(),
            Some(IntegrityError::BadArity { .. })
        ));
    }

    const HODGKIN: &str = "\
[[model]]
name: squid
membrane.V = -60 [mV]
potassium.n = 0.317

[engine]
time = 0 [ms]
    in [ms]
    bind time

[membrane]
use engine.time as t
C = 1 [uF/cm^2] : Membrane capacitance
dot(V) = -(i_k + 10 [uA/cm^2]) / C
    in [mV]
    label potential
i_k = potassium.i_k
    in [uA/cm^2]

[potassium]
g_max = 36 [mS/cm^2]
E = -88 [mV]
    in [mV]
dot(n) = alpha * (1 - n) - beta * n
alpha = 0.01 * (-membrane.V - 50) / (exp((-membrane.V - 50) / 10) - 1)
beta = 0.125 * exp(-(membrane.V + 60) / 80)
i_k = g_max * n^4 * (membrane.V - E)
";

    #[test]
    fn full_model_parses() {
        let model = parse_model(HODGKIN).unwrap();
        assert_eq!(model.name(), "squid");
        let membrane = model.component_by_name("membrane").unwrap();
        let v = model
            .variables(membrane)
            .find(|&v| model.var(v).name() == "V")
            .unwrap();
        assert!(model.var(v).is_state());
        assert_eq!(model.var(v).initial().unwrap().as_number(), Some(-60.0));
        assert_eq!(model.var(v).label(), Some("potential"));
        assert_eq!(model.var(v).unit(), model.units().lookup("mV"));
        assert_eq!(model.states().len(), 2);
        assert_eq!(model.time(), model.binding("time"));
        assert!(model.time().is_some());
        let c = model
            .variables(membrane)
            .find(|&v| model.var(v).name() == "C")
            .unwrap();
        assert_eq!(model.var(c).description(), Some("Membrane capacitance"));
        // forward reference: membrane.i_k refers to potassium.i_k
        let ik = model
            .variables(membrane)
            .find(|&v| model.var(v).name() == "i_k")
            .unwrap();
        assert!(model.var(ik).rhs().is_some());
    }

    #[test]
    fn model_code_round_trips() {
        let model = parse_model(HODGKIN).unwrap();
        let again = parse_model(&model.code()).unwrap();
        assert_eq!(again.name(), "squid");
        assert_eq!(again.states().len(), 2);
        // declaration order is preserved, so ids and equations line up
        for (a, b) in model.all_variables().into_iter().zip(again.all_variables()) {
            assert_eq!(model.qname(a), again.qname(b));
            match (model.var(a).rhs(), again.var(b).rhs()) {
                (Some(x), Some(y)) => assert_eq!(x.polish(), y.polish()),
                (x, y) => assert_eq!(x.is_some(), y.is_some()),
            }
        }
    }

    #[test]
    fn missing_initial_value_is_fatal() {
        let source = "\
[[model]]

[c]
dot(x) = 1
";
        let err = parse_model(source).unwrap_err();
        assert!(matches!(
            err.cause.as_deref(),
            Some(IntegrityError::MissingInitialValue { .. })
        ));
    }

    #[test]
    fn initial_value_for_non_state_is_rejected() {
        let source = "\
[[model]]
c.x = 3

[c]
x = 1 + 2
";
        let err = parse_model(source).unwrap_err();
        assert!(matches!(
            err.cause.as_deref(),
            Some(IntegrityError::NotAState { .. })
        ));
    }

    #[test]
    fn aliases_are_required_for_cross_component_shorthand() {
        let model = parse_model(HODGKIN).unwrap();
        let membrane = model.component_by_name("membrane").unwrap();
        let aliases = model.component(membrane).aliases();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].0, "t");
    }

    #[test]
    fn nested_variables_parse() {
        let source = "\
[[model]]

[c]
gate = alpha / (alpha + beta)
gate.alpha = 0.1
gate.beta = 0.2
";
        let model = parse_model(source).unwrap();
        let c = model.component_by_name("c").unwrap();
        let gate = model
            .variables(c)
            .find(|&v| model.var(v).name() == "gate")
            .unwrap();
        assert_eq!(model.var(gate).children().len(), 2);
        let alpha = model.resolve_nested(gate, "alpha").unwrap();
        assert_eq!(model.qname(alpha), "c.gate.alpha");
    }
}
