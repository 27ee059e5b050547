//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Path expressions.
//!
//! The engine addresses tree nodes with a restricted XPath dialect:
//! location steps separated by `/`, an optional axis per step
//! (`descendant-or-self::`, `..`, `.`, ...), name tests with `\` escapes
//! or `*`, and `[...]` predicates built from comparisons, `and`/`or`,
//! arithmetic on positions, the builtin functions `count`, `glob`,
//! `label`, `last`, `position` and `regexp`, and the `=~` match operator.
//! `//` abbreviates `/descendant-or-self::*/`. A leading `$name` resolves
//! through the symbol table.
//!
//! Expressions are compiled once into an AST ([`Pathx`]) and evaluated
//! against a [`Tree`] on demand; evaluation produces a document-ordered,
//! duplicate-free nodeset. Errors carry the 0-based character offset of
//! the offending input.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use regex::{Regex, RegexBuilder};

use crate::iter;
use crate::tree::{NodeId, NodeRef, Tree};

const MAX_PARSE_DEPTH: u32 = 128;
const MAX_VAR_DEPTH: u32 = 16;

/// Taxonomy of path-expression failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PathxErrorKind {
    Name,
    Str,
    Number,
    Delim,
    NoEqual,
    NoMem,
    Pred,
    Paren,
    Slash,
    Internal,
    Type,
    NoVar,
    End,
    NoMatch,
    Arity,
    Regexp,
    MMatch,
    RegexpFlag,
}

impl PathxErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            PathxErrorKind::Name => "empty name",
            PathxErrorKind::Str => "illegal string literal",
            PathxErrorKind::Number => "illegal number",
            PathxErrorKind::Delim => "string missing ending ' or \"",
            PathxErrorKind::NoEqual => "expected '='",
            PathxErrorKind::NoMem => "allocation failed",
            PathxErrorKind::Pred => "invalid predicate",
            PathxErrorKind::Paren => "unbalanced parentheses",
            PathxErrorKind::Slash => "stray '/'",
            PathxErrorKind::Internal => "internal error",
            PathxErrorKind::Type => "type error",
            PathxErrorKind::NoVar => "undefined variable",
            PathxErrorKind::End => "garbage at the end of the path expression",
            PathxErrorKind::NoMatch => "no match for path expression",
            PathxErrorKind::Arity => {
                "wrong number of arguments in function call"
            }
            PathxErrorKind::Regexp => "invalid regular expression",
            PathxErrorKind::MMatch => "more than one match",
            PathxErrorKind::RegexpFlag => "unknown regexp flag",
        }
    }
}

/// A failed parse or evaluation, with the 0-based offset into the
/// expression text where things went wrong.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct PathxError {
    pub kind: PathxErrorKind,
    pub pos: usize,
    pub text: String,
}

impl PathxError {
    /// The expression with a `|=|` marker at the failure offset.
    pub fn details(&self) -> String {
        let pos = self.pos.min(self.text.len());
        format!("{}|=|{}", &self.text[..pos], &self.text[pos..])
    }
}

type PResult<T> = std::result::Result<T, PathxError>;

// ===== expression AST =====

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Axis {
    SelfNode,
    Child,
    Parent,
    Ancestor,
    Descendant,
    DescendantOrSelf,
    PrecedingSibling,
    Root,
}

const AXES: &[(&str, Axis)] = &[
    ("ancestor", Axis::Ancestor),
    ("child", Axis::Child),
    ("descendant-or-self", Axis::DescendantOrSelf),
    ("descendant", Axis::Descendant),
    ("parent", Axis::Parent),
    ("preceding-sibling", Axis::PrecedingSibling),
    ("root", Axis::Root),
    ("self", Axis::SelfNode),
];

#[derive(Clone, Debug)]
pub(crate) struct Step {
    axis: Axis,
    /// `None` is the `*` name test, matching any node.
    name: Option<String>,
    predicates: Vec<Expr>,
}

#[derive(Clone, Debug)]
pub(crate) enum PathRoot {
    /// Absolute path, evaluated from the tree the expression is rooted at.
    Root,
    /// Relative path, evaluated from the context node.
    Context,
    /// Path starting at a symbol-table binding.
    Var(String),
}

#[derive(Clone, Debug)]
pub(crate) struct LocPath {
    root: PathRoot,
    /// Predicates applied to the root nodeset as a whole, e.g. `$v[2]`.
    filters: Vec<Expr>,
    steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BinaryOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Plus,
    Minus,
    Match,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Builtin {
    Count,
    Glob,
    Label,
    Last,
    Position,
    Regexp,
}

/// Builtin function table: name, minimum and maximum arity, dispatch tag.
const BUILTINS: &[(&str, usize, usize, Builtin)] = &[
    ("count", 1, 1, Builtin::Count),
    ("glob", 1, 2, Builtin::Glob),
    ("label", 0, 0, Builtin::Label),
    ("last", 0, 0, Builtin::Last),
    ("position", 0, 0, Builtin::Position),
    ("regexp", 1, 2, Builtin::Regexp),
];

#[derive(Clone, Debug)]
pub(crate) enum Expr {
    Number(i64),
    Literal(String),
    Path(LocPath),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

/// Evaluation result, a tagged value.
#[derive(Clone, Debug)]
pub(crate) enum Value {
    Number(i64),
    Str(String),
    Boolean(bool),
    Nodeset(Vec<NodeId>),
    Regexp(Regex),
}

// ===== parser =====

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    depth: u32,
}

fn is_name_char(c: char) -> bool {
    !c.is_whitespace()
        && !matches!(
            c,
            '/' | '[' | ']' | '(' | ')' | '=' | '<' | '>' | '!' | ','
                | '|' | '*' | '$' | '\'' | '"'
        )
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Parser<'a> {
        Parser {
            text,
            pos: 0,
            depth: 0,
        }
    }

    fn error<T>(&self, kind: PathxErrorKind) -> PResult<T> {
        Err(PathxError {
            kind,
            pos: self.pos,
            text: self.text.to_owned(),
        })
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.text[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return self.error(PathxErrorKind::NoMem);
        }
        Ok(())
    }

    fn parse(mut self, need_nodeset: bool) -> PResult<Expr> {
        self.skip_ws();
        let expr = self.parse_or()?;
        self.skip_ws();
        if self.pos != self.text.len() {
            return self.error(PathxErrorKind::End);
        }
        if need_nodeset && !can_be_nodeset(&expr) {
            self.pos = 0;
            return self.error(PathxErrorKind::Type);
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        self.enter()?;
        let mut expr = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.eat_keyword("or") {
                self.skip_ws();
                let rhs = self.parse_and()?;
                expr =
                    Expr::Binary(BinaryOp::Or, Box::new(expr), Box::new(rhs));
            } else {
                break;
            }
        }
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_eq()?;
        loop {
            self.skip_ws();
            if self.eat_keyword("and") {
                self.skip_ws();
                let rhs = self.parse_eq()?;
                expr = Expr::Binary(
                    BinaryOp::And,
                    Box::new(expr),
                    Box::new(rhs),
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    // A keyword operator must not run into a following name.
    fn eat_keyword(&mut self, kw: &str) -> bool {
        let rest = &self.text[self.pos..];
        if rest.starts_with(kw) {
            let after = rest[kw.len()..].chars().next();
            if !matches!(after, Some(c) if is_name_char(c)) {
                self.pos += kw.len();
                return true;
            }
        }
        false
    }

    fn parse_eq(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_rel()?;
        loop {
            self.skip_ws();
            let op = if self.eat_str("!=") {
                BinaryOp::Neq
            } else if self.eat_str("=~") {
                BinaryOp::Match
            } else if self.eat('=') {
                BinaryOp::Eq
            } else if self.peek() == Some('!') {
                self.bump();
                return self.error(PathxErrorKind::NoEqual);
            } else {
                break;
            };
            self.skip_ws();
            let rhs = self.parse_rel()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_rel(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_add()?;
        loop {
            self.skip_ws();
            let op = if self.eat_str("<=") {
                BinaryOp::Le
            } else if self.eat_str(">=") {
                BinaryOp::Ge
            } else if self.eat('<') {
                BinaryOp::Lt
            } else if self.eat('>') {
                BinaryOp::Gt
            } else {
                break;
            };
            self.skip_ws();
            let rhs = self.parse_add()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_add(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_union()?;
        loop {
            self.skip_ws();
            let op = if self.eat('+') {
                BinaryOp::Plus
            } else if self.eat('-') {
                BinaryOp::Minus
            } else {
                break;
            };
            self.skip_ws();
            let rhs = self.parse_union()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_union(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            self.skip_ws();
            if self.eat('|') {
                self.skip_ws();
                let rhs = self.parse_primary()?;
                expr = Expr::Union(Box::new(expr), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        self.enter()?;
        self.skip_ws();
        let expr = match self.peek() {
            Some('(') => {
                self.bump();
                let expr = self.parse_or()?;
                self.skip_ws();
                if !self.eat(')') {
                    return self.error(PathxErrorKind::Paren);
                }
                expr
            }
            Some(q @ '\'') | Some(q @ '"') => {
                self.bump();
                Expr::Literal(self.parse_string(q)?)
            }
            Some('$') => {
                self.bump();
                let name = self.parse_name()?;
                Expr::Path(self.parse_var_path(name)?)
            }
            Some(c) if c.is_ascii_digit() => self.parse_number_or_path()?,
            Some('/') | Some('.') | Some('*') => {
                Expr::Path(self.parse_loc_path()?)
            }
            Some(c) if is_name_char(c) || c == '\\' => {
                match self.parse_call()? {
                    Some(call) => call,
                    None => Expr::Path(self.parse_loc_path()?),
                }
            }
            _ => return self.error(PathxErrorKind::Name),
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_string(&mut self, quote: char) -> PResult<String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ '\\') | Some(c @ '\'') | Some(c @ '"') => {
                        out.push(c)
                    }
                    // Other escapes pass through untouched, so regexp
                    // patterns keep their backslashes.
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return self.error(PathxErrorKind::Str),
                },
                Some(c) => out.push(c),
                None => return self.error(PathxErrorKind::Delim),
            }
        }
    }

    fn parse_name(&mut self) -> PResult<String> {
        let mut out = String::new();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some(c) => out.push(c),
                        None => return self.error(PathxErrorKind::Name),
                    }
                }
                Some(c) if is_name_char(c) => {
                    out.push(c);
                    self.bump();
                }
                _ => break,
            }
        }
        if out.is_empty() {
            return self.error(PathxErrorKind::Name);
        }
        Ok(out)
    }

    // Numbers and label names both may start with a digit; a digit run
    // followed by more name characters is a name step like "1ipaddr".
    fn parse_number_or_path(&mut self) -> PResult<Expr> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        match self.peek() {
            Some(c) if is_name_char(c) || c == '\\' => {
                self.pos = start;
                Ok(Expr::Path(self.parse_loc_path()?))
            }
            _ => match self.text[start..self.pos].parse::<i64>() {
                Ok(n) => Ok(Expr::Number(n)),
                Err(_) => self.error(PathxErrorKind::Number),
            },
        }
    }

    // A builtin call, or `None` when the name turns out to be a step.
    fn parse_call(&mut self) -> PResult<Option<Expr>> {
        let start = self.pos;
        for (name, min, max, tag) in BUILTINS {
            if self.eat_str(name) {
                // A builtin name running into more name characters is a
                // plain label like "counter".
                if matches!(self.peek(), Some(c) if is_name_char(c)) {
                    self.pos = start;
                    continue;
                }
                self.skip_ws();
                if self.eat('(') {
                    let args = self.parse_args()?;
                    if args.len() < *min || args.len() > *max {
                        self.pos = start;
                        return self.error(PathxErrorKind::Arity);
                    }
                    return Ok(Some(Expr::Call(*tag, args)));
                }
                break;
            }
        }
        self.pos = start;
        Ok(None)
    }

    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            self.skip_ws();
            if self.eat(',') {
                self.skip_ws();
                continue;
            }
            if self.eat(')') {
                return Ok(args);
            }
            return self.error(PathxErrorKind::Paren);
        }
    }

    fn parse_var_path(&mut self, name: String) -> PResult<LocPath> {
        let mut filters = Vec::new();
        while self.peek() == Some('[') {
            filters.push(self.parse_predicate()?);
        }
        let mut steps = Vec::new();
        if self.eat('/') {
            self.parse_steps(&mut steps)?;
        }
        Ok(LocPath {
            root: PathRoot::Var(name),
            filters,
            steps,
        })
    }

    fn parse_loc_path(&mut self) -> PResult<LocPath> {
        let root = if self.eat('/') {
            PathRoot::Root
        } else {
            PathRoot::Context
        };
        let mut steps = Vec::new();
        if matches!(root, PathRoot::Root) && !self.at_step_start() {
            // A bare "/" selects the tree root itself.
            return Ok(LocPath {
                root,
                filters: Vec::new(),
                steps,
            });
        }
        self.parse_steps(&mut steps)?;
        Ok(LocPath {
            root,
            filters: Vec::new(),
            steps,
        })
    }

    fn at_step_start(&self) -> bool {
        matches!(self.peek(),
            Some(c) if c == '.' || c == '*' || c == '/' || c == '\\'
                || is_name_char(c))
    }

    fn parse_steps(&mut self, steps: &mut Vec<Step>) -> PResult<()> {
        loop {
            if self.eat('/') {
                // "//" abbreviates /descendant-or-self::*/
                steps.push(Step {
                    axis: Axis::DescendantOrSelf,
                    name: None,
                    predicates: Vec::new(),
                });
            }
            if !self.at_step_start() {
                return self.error(PathxErrorKind::Slash);
            }
            steps.push(self.parse_step()?);
            if !self.eat('/') {
                return Ok(());
            }
        }
    }

    // "." and ".." only denote the self and parent axes when they are
    // not the start of a longer name like ".hidden".
    fn dot_step(&mut self) -> Option<Axis> {
        let rest = &self.text[self.pos..];
        for (prefix, axis) in &[("..", Axis::Parent), (".", Axis::SelfNode)]
        {
            if rest.starts_with(prefix) {
                let after = rest[prefix.len()..].chars().next();
                if !matches!(after, Some(c) if is_name_char(c) || c == '\\')
                {
                    self.pos += prefix.len();
                    return Some(*axis);
                }
            }
        }
        None
    }

    fn parse_step(&mut self) -> PResult<Step> {
        let (axis, name) = if let Some(axis) = self.dot_step() {
            (axis, None)
        } else {
            let axis = self.parse_axis();
            if self.eat('*') {
                (axis, None)
            } else {
                (axis, Some(self.parse_name()?))
            }
        };

        let mut predicates = Vec::new();
        while self.peek() == Some('[') {
            predicates.push(self.parse_predicate()?);
        }
        Ok(Step {
            axis,
            name,
            predicates,
        })
    }

    fn parse_axis(&mut self) -> Axis {
        let rest = &self.text[self.pos..];
        for (name, axis) in AXES {
            if rest.starts_with(name) && rest[name.len()..].starts_with("::")
            {
                self.pos += name.len() + 2;
                return *axis;
            }
        }
        Axis::Child
    }

    fn parse_predicate(&mut self) -> PResult<Expr> {
        self.bump(); // '['
        self.skip_ws();
        let expr = self.parse_or()?;
        self.skip_ws();
        if !self.eat(']') {
            return self.error(PathxErrorKind::Pred);
        }
        Ok(expr)
    }
}

fn can_be_nodeset(expr: &Expr) -> bool {
    match expr {
        Expr::Path(_) => true,
        Expr::Union(l, r) => can_be_nodeset(l) && can_be_nodeset(r),
        _ => false,
    }
}

// ===== evaluator =====

/// Evaluation context: the node a predicate applies to, together with its
/// 1-based position in the candidate list and that list's size.
#[derive(Clone, Copy)]
struct Ctx {
    node: NodeId,
    position: usize,
    size: usize,
}

struct Eval<'a> {
    tree: &'a Tree,
    symtab: &'a Symtab,
    /// Evaluation root: target of absolute paths and the `root` axis.
    start: NodeId,
    text: &'a str,
    var_depth: std::cell::Cell<u32>,
}

impl<'a> Eval<'a> {
    fn error<T>(&self, kind: PathxErrorKind) -> PResult<T> {
        Err(PathxError {
            kind,
            pos: 0,
            text: self.text.to_owned(),
        })
    }

    fn eval(&self, expr: &Expr, ctx: Ctx) -> PResult<Value> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Literal(s) => Ok(Value::Str(s.clone())),
            Expr::Path(path) => self.eval_path(path, ctx),
            Expr::Union(l, r) => self.eval_union(l, r, ctx),
            Expr::Binary(op, l, r) => self.eval_binary(*op, l, r, ctx),
            Expr::Call(builtin, args) => self.eval_call(*builtin, args, ctx),
        }
    }

    fn eval_union(&self, l: &Expr, r: &Expr, ctx: Ctx) -> PResult<Value> {
        let (l, r) = (self.eval(l, ctx)?, self.eval(r, ctx)?);
        match (l, r) {
            (Value::Nodeset(mut l), Value::Nodeset(r)) => {
                let mut seen: HashSet<NodeId> = l.iter().copied().collect();
                for id in r {
                    if seen.insert(id) {
                        l.push(id);
                    }
                }
                Ok(Value::Nodeset(l))
            }
            _ => self.error(PathxErrorKind::Type),
        }
    }

    fn eval_path(&self, path: &LocPath, ctx: Ctx) -> PResult<Value> {
        let mut nodes = match &path.root {
            PathRoot::Root => vec![self.start],
            PathRoot::Context => vec![ctx.node],
            PathRoot::Var(name) => match self.eval_var(name, ctx)? {
                Value::Nodeset(ns) => ns,
                value if path.steps.is_empty()
                    && path.filters.is_empty() =>
                {
                    return Ok(value);
                }
                _ => return self.error(PathxErrorKind::Type),
            },
        };
        for filter in &path.filters {
            nodes = self.apply_predicate(nodes, filter)?;
        }
        for step in &path.steps {
            nodes = self.eval_step(&nodes, step)?;
        }
        Ok(Value::Nodeset(nodes))
    }

    fn eval_var(&self, name: &str, ctx: Ctx) -> PResult<Value> {
        let binding = match self.symtab.lookup(name) {
            Some(binding) => binding,
            None => return self.error(PathxErrorKind::NoVar),
        };
        match binding {
            Binding::Node(id) => {
                if self.tree.contains(*id) {
                    Ok(Value::Nodeset(vec![*id]))
                } else {
                    Ok(Value::Nodeset(Vec::new()))
                }
            }
            Binding::Expr(expr) => {
                self.var_depth.set(self.var_depth.get() + 1);
                if self.var_depth.get() > MAX_VAR_DEPTH {
                    return self.error(PathxErrorKind::Internal);
                }
                let value = self.eval(expr, ctx);
                self.var_depth.set(self.var_depth.get() - 1);
                value
            }
        }
    }

    fn axis_candidates(&self, step: &Step, node: NodeId) -> Vec<NodeId> {
        let tree = self.tree;
        match step.axis {
            Axis::SelfNode => vec![node],
            Axis::Child => NodeRef::new(tree, node)
                .children()
                .map(|n| n.id())
                .collect(),
            Axis::Parent => vec![tree.node(node).parent],
            Axis::Root => vec![self.start],
            Axis::Ancestor => {
                let start = NodeRef::new(tree, node);
                crate::iter::Ancestors::new(start.parent())
                    .map(|n| n.id())
                    .collect()
            }
            Axis::Descendant => iter::traverse(tree, node)
                .skip(1)
                .map(|n| n.id())
                .collect(),
            Axis::DescendantOrSelf => {
                iter::traverse(tree, node).map(|n| n.id()).collect()
            }
            Axis::PrecedingSibling => {
                let parent = tree.node(node).parent;
                if parent == node {
                    return Vec::new();
                }
                let children = &tree.node(parent).children;
                let pos = children
                    .iter()
                    .position(|c| *c == node)
                    .unwrap_or(0);
                children[..pos].iter().rev().copied().collect()
            }
        }
    }

    fn eval_step(
        &self,
        contexts: &[NodeId],
        step: &Step,
    ) -> PResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        for ctx in contexts {
            let mut candidates: Vec<NodeId> = self
                .axis_candidates(step, *ctx)
                .into_iter()
                .filter(|id| match &step.name {
                    Some(name) => {
                        self.tree.node(*id).label.as_deref()
                            == Some(name.as_str())
                    }
                    None => true,
                })
                .collect();
            for pred in &step.predicates {
                candidates = self.apply_predicate(candidates, pred)?;
            }
            for id in candidates {
                if seen.insert(id) {
                    result.push(id);
                }
            }
        }
        Ok(result)
    }

    fn apply_predicate(
        &self,
        candidates: Vec<NodeId>,
        pred: &Expr,
    ) -> PResult<Vec<NodeId>> {
        let size = candidates.len();
        let mut kept = Vec::new();
        for (i, node) in candidates.into_iter().enumerate() {
            let ctx = Ctx {
                node,
                position: i + 1,
                size,
            };
            let keep = match self.eval(pred, ctx)? {
                Value::Number(n) => (i + 1) as i64 == n,
                Value::Boolean(b) => b,
                Value::Nodeset(ns) => !ns.is_empty(),
                _ => return self.error(PathxErrorKind::Type),
            };
            if keep {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        l: &Expr,
        r: &Expr,
        ctx: Ctx,
    ) -> PResult<Value> {
        let l = self.eval(l, ctx)?;
        let r = self.eval(r, ctx)?;
        match op {
            BinaryOp::And => Ok(Value::Boolean(
                self.truth(&l)? && self.truth(&r)?,
            )),
            BinaryOp::Or => Ok(Value::Boolean(
                self.truth(&l)? || self.truth(&r)?,
            )),
            BinaryOp::Eq => Ok(Value::Boolean(self.compare_eq(&l, &r)?)),
            BinaryOp::Neq => Ok(Value::Boolean(self.compare_neq(&l, &r)?)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                self.compare_rel(op, &l, &r)
            }
            BinaryOp::Plus | BinaryOp::Minus => match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => {
                    let n = if op == BinaryOp::Plus {
                        a.wrapping_add(*b)
                    } else {
                        a.wrapping_sub(*b)
                    };
                    Ok(Value::Number(n))
                }
                _ => self.error(PathxErrorKind::Type),
            },
            BinaryOp::Match => self.compare_match(&l, &r),
        }
    }

    fn truth(&self, v: &Value) -> PResult<bool> {
        match v {
            Value::Boolean(b) => Ok(*b),
            Value::Nodeset(ns) => Ok(!ns.is_empty()),
            Value::Number(n) => Ok(*n != 0),
            _ => self.error(PathxErrorKind::Type),
        }
    }

    fn node_value(&self, id: NodeId) -> Option<&str> {
        self.tree.node(id).value.as_deref()
    }

    fn compare_eq(&self, l: &Value, r: &Value) -> PResult<bool> {
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => Ok(a == b),
            (Value::Str(a), Value::Str(b)) => Ok(a == b),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a == b),
            (Value::Nodeset(ns), Value::Str(s))
            | (Value::Str(s), Value::Nodeset(ns)) => Ok(ns
                .iter()
                .any(|id| self.node_value(*id) == Some(s.as_str()))),
            (Value::Nodeset(a), Value::Nodeset(b)) => Ok(a.iter().any(|x| {
                b.iter().any(|y| {
                    self.node_value(*x).is_some()
                        && self.node_value(*x) == self.node_value(*y)
                })
            })),
            _ => self.error(PathxErrorKind::Type),
        }
    }

    fn compare_neq(&self, l: &Value, r: &Value) -> PResult<bool> {
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => Ok(a != b),
            (Value::Str(a), Value::Str(b)) => Ok(a != b),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a != b),
            (Value::Nodeset(ns), Value::Str(s))
            | (Value::Str(s), Value::Nodeset(ns)) => Ok(ns
                .iter()
                .any(|id| self.node_value(*id) != Some(s.as_str()))),
            _ => self.error(PathxErrorKind::Type),
        }
    }

    fn compare_rel(
        &self,
        op: BinaryOp,
        l: &Value,
        r: &Value,
    ) -> PResult<Value> {
        let ord = match (l, r) {
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => return self.error(PathxErrorKind::Type),
        };
        let b = match op {
            BinaryOp::Lt => ord == std::cmp::Ordering::Less,
            BinaryOp::Le => ord != std::cmp::Ordering::Greater,
            BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
            _ => ord != std::cmp::Ordering::Less,
        };
        Ok(Value::Boolean(b))
    }

    fn compare_match(&self, l: &Value, r: &Value) -> PResult<Value> {
        let rx = match r {
            Value::Regexp(rx) => rx,
            _ => return self.error(PathxErrorKind::Type),
        };
        let b = match l {
            Value::Str(s) => rx.is_match(s),
            Value::Nodeset(ns) => ns.iter().any(|id| {
                self.node_value(*id).map_or(false, |v| rx.is_match(v))
            }),
            _ => return self.error(PathxErrorKind::Type),
        };
        Ok(Value::Boolean(b))
    }

    fn eval_call(
        &self,
        builtin: Builtin,
        args: &[Expr],
        ctx: Ctx,
    ) -> PResult<Value> {
        match builtin {
            Builtin::Count => match self.eval(&args[0], ctx)? {
                Value::Nodeset(ns) => Ok(Value::Number(ns.len() as i64)),
                _ => self.error(PathxErrorKind::Type),
            },
            Builtin::Label => {
                let label = self
                    .tree
                    .node(ctx.node)
                    .label
                    .clone()
                    .unwrap_or_default();
                Ok(Value::Str(label))
            }
            Builtin::Last => Ok(Value::Number(ctx.size as i64)),
            Builtin::Position => Ok(Value::Number(ctx.position as i64)),
            Builtin::Regexp => {
                let pattern = self.string_arg(&args[0], ctx)?;
                let flags = self.flag_arg(args.get(1), ctx)?;
                self.compile_regexp(&pattern, flags)
            }
            Builtin::Glob => {
                let pattern = self.string_arg(&args[0], ctx)?;
                let flags = self.flag_arg(args.get(1), ctx)?;
                self.compile_regexp(&glob_to_regex(&pattern), flags)
            }
        }
    }

    fn string_arg(&self, arg: &Expr, ctx: Ctx) -> PResult<String> {
        match self.eval(arg, ctx)? {
            Value::Str(s) => Ok(s),
            _ => self.error(PathxErrorKind::Type),
        }
    }

    // The only recognized regexp flag is 'i' for case-insensitive
    // matching.
    fn flag_arg(&self, arg: Option<&Expr>, ctx: Ctx) -> PResult<bool> {
        match arg {
            None => Ok(false),
            Some(arg) => match self.eval(arg, ctx)? {
                Value::Str(ref s) if s == "i" => Ok(true),
                Value::Str(_) => self.error(PathxErrorKind::RegexpFlag),
                _ => self.error(PathxErrorKind::Type),
            },
        }
    }

    fn compile_regexp(
        &self,
        pattern: &str,
        nocase: bool,
    ) -> PResult<Value> {
        // Matches must cover the entire value.
        let anchored = format!("^(?:{})$", pattern);
        match RegexBuilder::new(&anchored)
            .case_insensitive(nocase)
            .build()
        {
            Ok(rx) => Ok(Value::Regexp(rx)),
            Err(_) => self.error(PathxErrorKind::Regexp),
        }
    }
}

/// Translate a shell glob into a regular expression.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::new();
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    out.push(c);
                }
                out.push(']');
            }
            '\\' => {
                if let Some(c) = chars.next() {
                    out.push_str(&regex::escape(&c.to_string()));
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

// ===== impl Pathx =====

/// A compiled path expression.
#[derive(Debug)]
pub(crate) struct Pathx {
    expr: Rc<Expr>,
    text: String,
    /// Context node for relative expressions.
    root_ctx: Option<NodeId>,
    matches: Option<Vec<NodeId>>,
    idx: usize,
}

impl Pathx {
    /// Compile `text`. With `need_nodeset`, reject expressions that can
    /// never evaluate to a nodeset.
    pub fn parse(
        text: &str,
        need_nodeset: bool,
        root_ctx: Option<NodeId>,
    ) -> PResult<Pathx> {
        let expr = Parser::new(text).parse(need_nodeset)?;
        Ok(Pathx {
            expr: Rc::new(expr),
            text: text.to_owned(),
            root_ctx,
            matches: None,
            idx: 0,
        })
    }

    /// Hand the compiled expression to the symbol table.
    pub fn expr(&self) -> Rc<Expr> {
        Rc::clone(&self.expr)
    }

    fn eval_ctx<'a>(
        &'a self,
        tree: &'a Tree,
        symtab: &'a Symtab,
        start: NodeId,
    ) -> (Eval<'a>, Ctx) {
        let eval = Eval {
            tree,
            symtab,
            start,
            text: &self.text,
            var_depth: std::cell::Cell::new(0),
        };
        let ctx = Ctx {
            node: self.root_ctx.unwrap_or(start),
            position: 1,
            size: 1,
        };
        (eval, ctx)
    }

    /// Evaluate to an arbitrary value.
    pub fn eval_value(
        &self,
        tree: &Tree,
        symtab: &Symtab,
        start: NodeId,
    ) -> PResult<Value> {
        let (eval, ctx) = self.eval_ctx(tree, symtab, start);
        eval.eval(&self.expr, ctx)
    }

    /// Evaluate to a nodeset, caching the result for iteration.
    pub fn nodeset(
        &mut self,
        tree: &Tree,
        symtab: &Symtab,
        start: NodeId,
    ) -> PResult<&[NodeId]> {
        if self.matches.is_none() {
            let matches = match self.eval_value(tree, symtab, start)? {
                Value::Nodeset(ns) => ns,
                _ => {
                    return Err(PathxError {
                        kind: PathxErrorKind::Type,
                        pos: 0,
                        text: self.text.clone(),
                    });
                }
            };
            self.matches = Some(matches);
            self.idx = 0;
        }
        Ok(self.matches.as_deref().unwrap_or(&[]))
    }

    /// First match in document order, restarting the iteration.
    pub fn first(
        &mut self,
        tree: &Tree,
        symtab: &Symtab,
        start: NodeId,
    ) -> PResult<Option<NodeId>> {
        self.nodeset(tree, symtab, start)?;
        self.idx = 1;
        Ok(self.matches.as_ref().and_then(|m| m.first().copied()))
    }

    /// The match after the one `first`/`next` last returned.
    pub fn next(&mut self) -> Option<NodeId> {
        let matches = self.matches.as_ref()?;
        let id = matches.get(self.idx).copied();
        if id.is_some() {
            self.idx += 1;
        }
        id
    }

    /// Number of matches, with the first one when there is any.
    pub fn find_one(
        &mut self,
        tree: &Tree,
        symtab: &Symtab,
        start: NodeId,
    ) -> PResult<(usize, Option<NodeId>)> {
        let matches = self.nodeset(tree, symtab, start)?;
        Ok((matches.len(), matches.first().copied()))
    }

    /// Find the node matching the expression, creating it (and any
    /// missing ancestors along a plain child-step suffix) if the
    /// expression does not match yet.
    pub fn expand_tree(
        &mut self,
        tree: &mut Tree,
        symtab: &Symtab,
        start: NodeId,
    ) -> PResult<NodeId> {
        self.matches = None;
        {
            let matches = self.nodeset(tree, symtab, start)?;
            match matches.len() {
                1 => return Ok(matches[0]),
                0 => {}
                _ => {
                    return Err(PathxError {
                        kind: PathxErrorKind::MMatch,
                        pos: 0,
                        text: self.text.clone(),
                    });
                }
            }
        }
        self.matches = None;

        let path = match self.expr.as_ref() {
            Expr::Path(path) => path.clone(),
            _ => return self.expand_error(PathxErrorKind::NoMatch),
        };

        let mut current = match &path.root {
            PathRoot::Root => start,
            PathRoot::Context => self.root_ctx.unwrap_or(start),
            PathRoot::Var(name) => {
                let (eval, ctx) = self.eval_ctx(tree, symtab, start);
                match eval.eval_var(name, ctx)? {
                    Value::Nodeset(ns) if ns.len() == 1 => ns[0],
                    Value::Nodeset(_) => {
                        return self.expand_error(PathxErrorKind::NoMatch)
                    }
                    _ => return self.expand_error(PathxErrorKind::Type),
                }
            }
        };
        if !path.filters.is_empty() {
            return self.expand_error(PathxErrorKind::NoMatch);
        }

        for step in &path.steps {
            let found = {
                let (eval, _) = self.eval_ctx(tree, symtab, start);
                eval.eval_step(&[current], step)?
            };
            match found.len() {
                1 => current = found[0],
                0 => {
                    let name = match (&step.axis, &step.name) {
                        (Axis::Child, Some(name)) => name.clone(),
                        _ => {
                            return self
                                .expand_error(PathxErrorKind::NoMatch)
                        }
                    };
                    current = tree.append(current, Some(name), None);
                }
                _ => return self.expand_error(PathxErrorKind::MMatch),
            }
        }
        Ok(current)
    }

    fn expand_error<T>(&self, kind: PathxErrorKind) -> PResult<T> {
        Err(PathxError {
            kind,
            pos: 0,
            text: self.text.clone(),
        })
    }
}

// ===== symbol table =====

/// A symbol-table binding: either a compiled expression, re-evaluated
/// whenever the variable is used, or a direct node reference.
pub(crate) enum Binding {
    Expr(Rc<Expr>),
    Node(NodeId),
}

/// Named bindings created by `defvar`/`defnode`.
#[derive(Default)]
pub(crate) struct Symtab {
    bindings: HashMap<String, Binding>,
}

impl Symtab {
    pub fn new() -> Symtab {
        Symtab {
            bindings: HashMap::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn define_expr(&mut self, name: &str, px: &Pathx) {
        self.bindings
            .insert(name.to_owned(), Binding::Expr(px.expr()));
    }

    pub fn define_node(&mut self, name: &str, id: NodeId) {
        self.bindings.insert(name.to_owned(), Binding::Node(id));
    }

    pub fn undefine(&mut self, name: &str) {
        self.bindings.remove(name);
    }

    /// Drop every node binding that points into the subtree rooted at
    /// `root`. Run before unlinking the subtree.
    pub fn remove_descendants(&mut self, tree: &Tree, root: NodeId) {
        self.bindings.retain(|_, binding| match binding {
            Binding::Node(id) => {
                !(tree.contains(*id) && tree.is_descendant(*id, root))
            }
            Binding::Expr(_) => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translation() {
        assert_eq!(glob_to_regex("*.repo"), ".*\\.repo");
        assert_eq!(glob_to_regex("ifcfg-?"), "ifcfg\\-.");
        assert_eq!(glob_to_regex("[!a]x"), "[^a]x");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Pathx::parse("/a/b", true, None).is_ok());
        assert_eq!(
            Pathx::parse("/a/b gunk", true, None).unwrap_err().kind,
            PathxErrorKind::End
        );
        assert_eq!(
            Pathx::parse("/a/", true, None).unwrap_err().kind,
            PathxErrorKind::Slash
        );
        assert_eq!(
            Pathx::parse("'lone string'", true, None).unwrap_err().kind,
            PathxErrorKind::Type
        );
    }

    #[test]
    fn error_details_mark_the_offset() {
        let err = Pathx::parse("/a/b[", true, None).unwrap_err();
        assert_eq!(err.details(), "/a/b[|=|");
    }
}
