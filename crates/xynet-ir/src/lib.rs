#![doc = "xynet IR - template data model consumed by the netlist compiler\n\nContents:\n- EquationSet / Variable / EquationEntry: the hierarchical part templates\n- Expr: already-parsed expression trees with an infix printer (see expr)\n- Evaluator / Bindings: the evaluation seam and a basic reference evaluator (see eval)\n- A readable textual printer for templates (EquationSet::to_text)\n\nReserved variable names understood by the compiler: `$n` (population), `$xyz` (position),\n`$p` (connection probability), `$index` (instance index) and `$t` (simulation time).\n"]
#![warn(missing_docs)]

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod eval;
pub mod expr;

pub use eval::{BasicEvaluator, Bindings, EvalError, Evaluator, Value};
pub use expr::{BinaryOp, Expr, ExprWriter, UnaryOp, PULSE, SINEWAVE};

/// Population count of a compartment part
pub const POPULATION: &str = "$n";
/// Position of a compartment instance
pub const POSITION: &str = "$xyz";
/// Connection probability of a connection part
pub const PROBABILITY: &str = "$p";
/// Index of an instance within its part
pub const INDEX: &str = "$index";
/// Simulation time
pub const TIME: &str = "$t";

/// Named alias from a connection part to the part it links
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionBinding {
    /// Alias used inside the connection's equations (e.g. `A`)
    pub alias: String,
    /// Name or dotted path of the referenced part
    pub target: String,
}

/// One right-hand side of a variable
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EquationEntry {
    /// Right-hand side
    pub expression: Expr,
    /// Guard; the equation applies only where this is truthy
    #[cfg_attr(feature = "serde", serde(default))]
    pub condition: Option<Expr>,
    /// Applies only while setting initial conditions
    #[cfg_attr(feature = "serde", serde(default))]
    pub initial: bool,
    /// Free-form tags (device bindings, `ignore`)
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
}

impl EquationEntry {
    /// Unconditional equation
    pub fn new(expression: Expr) -> Self {
        Self {
            expression,
            condition: None,
            initial: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a guard
    pub fn when(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Mark as an initial-condition equation
    pub fn at_init(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Attach a metadata tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag lookup
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A named quantity and its candidate equations
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Differential order (0 = algebraic, 1 = first derivative)
    #[cfg_attr(feature = "serde", serde(default))]
    pub order: u32,
    /// Candidate equations, in priority order
    #[cfg_attr(feature = "serde", serde(default))]
    pub equations: Vec<EquationEntry>,
}

impl Variable {
    /// Variable with no equations yet
    pub fn new(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            order,
            equations: Vec::new(),
        }
    }

    /// Order-0 variable with a single unconditional equation
    pub fn equation(name: impl Into<String>, expression: Expr) -> Self {
        Self::new(name, 0).with_equation(EquationEntry::new(expression))
    }

    /// First-order variable with a single unconditional derivative
    pub fn derivative(name: impl Into<String>, expression: Expr) -> Self {
        Self::new(name, 1).with_equation(EquationEntry::new(expression))
    }

    /// Append a candidate equation
    pub fn with_equation(mut self, equation: EquationEntry) -> Self {
        self.equations.push(equation);
        self
    }

    /// True for `$`-prefixed structural variables
    pub fn is_reserved(&self) -> bool {
        self.name.starts_with('$')
    }

    /// Tag value carried by any of the equations
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.equations.iter().find_map(|e| e.tag(key))
    }
}

/// Template node: a population of compartments or a connection between parts
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EquationSet {
    /// Name, unique among siblings
    pub name: String,
    /// Sub-parts
    #[cfg_attr(feature = "serde", serde(default))]
    pub parts: Vec<EquationSet>,
    /// Variables
    #[cfg_attr(feature = "serde", serde(default))]
    pub variables: Vec<Variable>,
    /// Present iff this node is a connection
    #[cfg_attr(feature = "serde", serde(default))]
    pub connection_bindings: Vec<ConnectionBinding>,
    /// Free-form tags (e.g. `device`)
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
}

impl EquationSet {
    /// Empty template
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a sub-part
    pub fn with_part(mut self, part: EquationSet) -> Self {
        self.parts.push(part);
        self
    }

    /// Add a variable
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Add a connection binding, turning this node into a connection
    pub fn with_binding(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.connection_bindings.push(ConnectionBinding {
            alias: alias.into(),
            target: target.into(),
        });
        self
    }

    /// Add a metadata tag
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True if this node links other parts instead of holding compartments
    pub fn is_connection(&self) -> bool {
        !self.connection_bindings.is_empty()
    }

    /// Variable lookup by name
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Variable position by name
    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    /// Readable textual form of the template tree
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        Self::print_part(&mut out, self, 0);
        out
    }

    fn print_indent(out: &mut String, n: usize) {
        for _ in 0..n {
            out.push(' ');
        }
    }

    fn print_kv_list(out: &mut String, attrs: &BTreeMap<String, String>) {
        let mut first = true;
        for (k, v) in attrs {
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push_str(k);
            if !v.is_empty() {
                out.push_str(" = ");
                out.push_str(v);
            }
        }
    }

    fn print_part(out: &mut String, part: &EquationSet, indent: usize) {
        Self::print_indent(out, indent);
        if part.is_connection() {
            out.push_str("connect ");
            out.push_str(&part.name);
            out.push_str(" (");
            let bindings: Vec<String> = part
                .connection_bindings
                .iter()
                .map(|b| format!("{} -> {}", b.alias, b.target))
                .collect();
            out.push_str(&bindings.join(", "));
            out.push(')');
        } else {
            out.push_str("part ");
            out.push_str(&part.name);
        }
        if !part.metadata.is_empty() {
            out.push_str(" [");
            Self::print_kv_list(out, &part.metadata);
            out.push(']');
        }
        out.push_str(" {\n");

        for v in &part.variables {
            let ticks = "'".repeat(v.order as usize);
            if v.equations.is_empty() {
                Self::print_indent(out, indent + 2);
                out.push_str(&format!("{}{}\n", v.name, ticks));
            }
            for e in &v.equations {
                Self::print_indent(out, indent + 2);
                out.push_str(&format!("{}{} = {}", v.name, ticks, e.expression));
                if let Some(c) = &e.condition {
                    out.push_str(&format!(" when {}", c));
                }
                if e.initial {
                    out.push_str(" @init");
                }
                if !e.metadata.is_empty() {
                    out.push_str(" [");
                    Self::print_kv_list(out, &e.metadata);
                    out.push(']');
                }
                out.push('\n');
            }
        }

        for child in &part.parts {
            Self::print_part(out, child, indent + 2);
        }

        Self::print_indent(out, indent);
        out.push_str("}\n");
    }
}


#[cfg(all(test, feature = "serde"))]
mod serde_tests {
    use super::*;

    #[test]
    fn template_loads_from_json() {
        let json = r#"{
            "name": "model",
            "parts": [{
                "name": "layer",
                "variables": [
                    { "name": "$n", "equations": [ { "expression": { "num": 4.0 } } ] },
                    { "name": "V", "order": 1, "equations": [
                        { "expression": { "unary": ["neg", { "var": "V" }] } },
                        { "expression": { "num": -65.0 }, "initial": true }
                    ] }
                ]
            }]
        }"#;
        let t: EquationSet = serde_json::from_str(json).expect("parse template");
        let layer = &t.parts[0];
        assert_eq!(layer.variables[1].order, 1);
        assert!(layer.variables[1].equations[1].initial);
        assert_eq!(layer.variables[1].equations[0].expression, -Expr::var("V"));
    }
}
