//! Evaluation seam.
//!
//! The compiler never evaluates expressions itself; it asks an [`Evaluator`]
//! with a [`Bindings`] implementation that knows how to look names up for one
//! particular instance. [`BasicEvaluator`] covers arithmetic, comparisons and
//! the common math functions, which is all the structural equations need.

use crate::expr::{BinaryOp, Expr, UnaryOp, PULSE, SINEWAVE};

/// Result alias for evaluation
pub type Result<T> = std::result::Result<T, EvalError>;

/// Evaluation errors
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The expression depends on something that has no static value yet
    /// (simulation time, integrated state, an unbound name).
    #[error("'{0}' is not evaluable before simulation")]
    NotEvaluable(String),

    /// Function not known to the evaluator
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Wrong number of arguments
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        /// Function name
        name: String,
        /// Expected count description
        expected: String,
        /// Supplied count
        got: usize,
    },

    /// Operand of the wrong shape
    #[error("type error: {0}")]
    Type(String),

    /// Structurally invalid input discovered while evaluating
    #[error("{0}")]
    Invalid(String),
}

impl EvalError {
    /// True for the one recoverable case: "no value yet"
    pub fn is_not_evaluable(&self) -> bool {
        matches!(self, EvalError::NotEvaluable(_))
    }
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Number (booleans are 0/1)
    Scalar(f64),
    /// Numeric vector
    Array(Vec<f64>),
    /// Anything textual
    Text(String),
}

impl Value {
    /// Scalar payload, if any
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Nonzero scalars and non-empty arrays/text are truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Scalar(v) => *v != 0.0,
            Value::Array(a) => !a.is_empty(),
            Value::Text(t) => !t.is_empty(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Text(_) => "text",
        }
    }
}

/// Name lookup for one evaluation context
pub trait Bindings {
    /// Resolve a variable reference
    fn lookup(&self, name: &str) -> Result<Value>;
}

/// Expression evaluator
pub trait Evaluator {
    /// Evaluate `expr` with names resolved through `bindings`
    fn evaluate(&self, expr: &Expr, bindings: &dyn Bindings) -> Result<Value>;
}

/// Reference evaluator: arithmetic, logic, vectors and scalar math functions
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl Evaluator for BasicEvaluator {
    fn evaluate(&self, expr: &Expr, bindings: &dyn Bindings) -> Result<Value> {
        match expr {
            Expr::Num(v) => Ok(Value::Scalar(*v)),
            Expr::Var(name) => bindings.lookup(name),
            Expr::Unary(op, e) => {
                let v = scalar(self.evaluate(e, bindings)?, "unary operand")?;
                Ok(Value::Scalar(match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => bool_to_f64(v == 0.0),
                }))
            }
            Expr::Binary(op, l, r) => {
                let a = scalar(self.evaluate(l, bindings)?, op.symbol())?;
                let b = scalar(self.evaluate(r, bindings)?, op.symbol())?;
                Ok(Value::Scalar(apply_binary(*op, a, b)))
            }
            Expr::Call(name, args) => self.call(name, args, bindings),
            Expr::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(scalar(self.evaluate(item, bindings)?, "vector element")?);
                }
                Ok(Value::Array(out))
            }
        }
    }
}

impl BasicEvaluator {
    fn call(&self, name: &str, args: &[Expr], bindings: &dyn Bindings) -> Result<Value> {
        // Waveforms are functions of simulation time.
        if name == PULSE || name == SINEWAVE {
            return Err(EvalError::NotEvaluable("$t".into()));
        }

        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(scalar(self.evaluate(a, bindings)?, name)?);
        }

        let unary = |f: fn(f64) -> f64| -> Result<Value> {
            match values.as_slice() {
                [x] => Ok(Value::Scalar(f(*x))),
                _ => Err(arity(name, "1", values.len())),
            }
        };

        match name {
            "sin" => unary(f64::sin),
            "cos" => unary(f64::cos),
            "tan" => unary(f64::tan),
            "exp" => unary(f64::exp),
            "log" | "ln" => unary(f64::ln),
            "sqrt" => unary(f64::sqrt),
            "abs" => unary(f64::abs),
            "floor" => unary(f64::floor),
            "ceil" => unary(f64::ceil),
            "round" => unary(f64::round),
            "pow" => match values.as_slice() {
                [a, b] => Ok(Value::Scalar(a.powf(*b))),
                _ => Err(arity(name, "2", values.len())),
            },
            "min" | "max" => {
                if values.is_empty() {
                    return Err(arity(name, "at least 1", 0));
                }
                let pick = if name == "min" { f64::min } else { f64::max };
                let first = values[0];
                Ok(Value::Scalar(values[1..].iter().fold(first, |acc, v| pick(acc, *v))))
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }
}

fn scalar(value: Value, context: &str) -> Result<f64> {
    match value {
        Value::Scalar(v) => Ok(v),
        other => Err(EvalError::Type(format!("expected scalar for {}, got {}", context, other.kind()))),
    }
}

fn arity(name: &str, expected: &str, got: usize) -> EvalError {
    EvalError::Arity { name: name.to_string(), expected: expected.to_string(), got }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Lt => bool_to_f64(a < b),
        BinaryOp::Le => bool_to_f64(a <= b),
        BinaryOp::Gt => bool_to_f64(a > b),
        BinaryOp::Ge => bool_to_f64(a >= b),
        BinaryOp::Eq => bool_to_f64(a == b),
        BinaryOp::Ne => bool_to_f64(a != b),
        BinaryOp::And => bool_to_f64(a != 0.0 && b != 0.0),
        BinaryOp::Or => bool_to_f64(a != 0.0 || b != 0.0),
    }
}
