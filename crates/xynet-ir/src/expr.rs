//! Already-parsed expression AST consumed by the compiler.
//!
//! Expressions arrive fully parsed; this module only provides the tree, a few
//! structural queries (free variables, waveform detection) and a printer that
//! other crates drive through [`ExprWriter`] to emit their own dialect.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Name of the pulse-generator function recognised by the classifier
pub const PULSE: &str = "pulse";
/// Name of the sine-wave generator function recognised by the classifier
pub const SINEWAVE: &str = "sinewave";

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical not
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `^`
    Pow,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`
    And,
    /// `||`
    Or,
}

impl BinaryOp {
    /// Infix symbol used by the plain printer
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Binding strength; higher binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div => 5,
            BinaryOp::Pow => 6,
        }
    }
}

const UNARY_PRECEDENCE: u8 = 7;

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum Expr {
    /// Numeric literal
    Num(f64),
    /// Reference to a variable (possibly `alias.name` or a reserved `$name`)
    Var(String),
    /// Unary operation
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Function call
    Call(String, Vec<Expr>),
    /// Vector literal, e.g. a position `[x, y, z]`
    Vector(Vec<Expr>),
}

impl Expr {
    /// Numeric literal
    pub fn num(v: f64) -> Self {
        Expr::Num(v)
    }

    /// Variable reference
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// Function call
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(name.into(), args)
    }

    /// Vector literal
    pub fn vector(items: Vec<Expr>) -> Self {
        Expr::Vector(items)
    }

    /// Binary operation
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// Comparison helper: `self < other`
    pub fn lt(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, self, other)
    }

    /// Comparison helper: `self == other`
    pub fn equals(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, self, other)
    }

    /// Power helper: `self ^ other`
    pub fn pow(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Pow, self, other)
    }

    /// All variable names referenced anywhere in the tree
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Unary(_, e) => e.collect_variables(out),
            Expr::Binary(_, l, r) => {
                l.collect_variables(out);
                r.collect_variables(out);
            }
            Expr::Call(_, args) | Expr::Vector(args) => {
                for a in args {
                    a.collect_variables(out);
                }
            }
        }
    }

    /// True if `name` is referenced anywhere in the tree
    pub fn mentions(&self, name: &str) -> bool {
        match self {
            Expr::Num(_) => false,
            Expr::Var(v) => v == name,
            Expr::Unary(_, e) => e.mentions(name),
            Expr::Binary(_, l, r) => l.mentions(name) || r.mentions(name),
            Expr::Call(_, args) | Expr::Vector(args) => args.iter().any(|a| a.mentions(name)),
        }
    }

    /// If the whole expression is a call to `function`, its arguments
    pub fn as_call_to(&self, function: &str) -> Option<&[Expr]> {
        match self {
            Expr::Call(name, args) if name == function => Some(args),
            _ => None,
        }
    }

    /// Print through a dialect-specific writer
    pub fn write<W: ExprWriter>(&self, writer: &mut W) -> Result<String, W::Error> {
        self.write_prec(writer, 0)
    }

    fn write_prec<W: ExprWriter>(&self, writer: &mut W, parent: u8) -> Result<String, W::Error> {
        match self {
            Expr::Num(v) => Ok(format_number(*v)),
            Expr::Var(name) => writer.variable(name),
            Expr::Unary(op, e) => {
                let inner = e.write_prec(writer, UNARY_PRECEDENCE)?;
                let sym = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                Ok(format!("{}{}", sym, inner))
            }
            Expr::Binary(op, l, r) => {
                let prec = op.precedence();
                // Pow is right-associative, everything else left-associative.
                let (lp, rp) = if *op == BinaryOp::Pow { (prec + 1, prec) } else { (prec, prec + 1) };
                let left = l.write_prec(writer, lp)?;
                let right = r.write_prec(writer, rp)?;
                let text = format!("{} {} {}", left, writer.binary_op(*op), right);
                if prec < parent {
                    Ok(format!("({})", text))
                } else {
                    Ok(text)
                }
            }
            Expr::Call(name, args) => {
                let rendered = args
                    .iter()
                    .map(|a| a.write_prec(writer, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                writer.function(name, rendered)
            }
            Expr::Vector(items) => {
                let rendered = items
                    .iter()
                    .map(|a| a.write_prec(writer, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                writer.vector(rendered)
            }
        }
    }
}

/// Hooks used by [`Expr::write`]. Precedence and parenthesisation are handled
/// by the caller; implementors only decide how leaves and operators look.
pub trait ExprWriter {
    /// Error raised while resolving names
    type Error;

    /// Render a variable reference
    fn variable(&mut self, name: &str) -> Result<String, Self::Error>;

    /// Render a function call with already-rendered arguments
    fn function(&mut self, name: &str, args: Vec<String>) -> Result<String, Self::Error> {
        Ok(format!("{}({})", name, args.join(", ")))
    }

    /// Render a vector literal
    fn vector(&mut self, items: Vec<String>) -> Result<String, Self::Error> {
        Ok(format!("[{}]", items.join(", ")))
    }

    /// Operator text for a binary operation
    fn binary_op(&self, op: BinaryOp) -> &'static str {
        op.symbol()
    }
}

struct PlainWriter;

impl ExprWriter for PlainWriter {
    type Error = Infallible;

    fn variable(&mut self, name: &str) -> Result<String, Infallible> {
        Ok(name.to_string())
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.write(&mut PlainWriter) {
            Ok(text) => f.write_str(&text),
            Err(never) => match never {},
        }
    }
}

/// Canonical number formatting shared by every printer
pub fn format_number(v: f64) -> String {
    if v == 0.0 {
        // Avoid "-0"
        return "0".to_string();
    }
    format!("{}", v)
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Div, self, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(self))
    }
}
