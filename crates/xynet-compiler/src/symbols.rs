//! Equation classification and the memoized symbol table.
//!
//! Every equation that reaches the netlist is classified once into a
//! [`SymbolKind`]; later references to the same equation get the same
//! [`Rc<SymbolDef>`] back. Rules are tried in a fixed priority order:
//!
//! 1. derivative order above 1 is rejected
//! 2. first-order update equations are state (or additive coupling into an
//!    endpoint when the variable is named `<alias>.<var>` on a connection)
//! 3. `pulse(...)` and 4. `sinewave(...)` become independent sources
//! 5. anything mentioning `$t` is a time-varying source
//! 6. initial equations of variables that also have update equations are
//!    initial conditions
//! 7. everything else is evaluated at its representative instance: numbers
//!    become parameters, "not evaluable yet" becomes a function of its free
//!    variables
//!
//! Initial equations skip rules 2 to 5.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use log::debug;
use xynet_ir::eval::EvalError;
use xynet_ir::{Evaluator, Expr, Value, INDEX, POPULATION, POSITION, PULSE, SINEWAVE, TIME};

use crate::device::DeviceMapping;
use crate::error::{CompilerError, Result};
use crate::network::{Network, PartId, PartKind, Serial};
use crate::scope::{representative, Phase, Scope};

/// Identity of one equation in the expanded network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EquationKey {
    /// Owning part
    pub part: PartId,
    /// Variable index in the part template
    pub variable: usize,
    /// Equation index in the variable
    pub equation: usize,
}

/// Translation strategy chosen for an equation
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    /// Integrated first-order state on its own node
    State,
    /// Additive current into an endpoint's state node
    Coupling {
        /// Endpoint slot (0 = pre, 1 = post)
        endpoint: usize,
        /// Variable of the endpoint part receiving the current
        target: String,
    },
    /// Pulse voltage source
    Pulse,
    /// Sine voltage source
    SineWave,
    /// Behavioural source re-evaluated as time advances
    TimeVarying,
    /// Constant initial condition, value at the representative instance
    InitialCondition {
        /// Value at the representative instance
        value: f64,
    },
    /// Constant parameter, value at the representative instance
    Parameter {
        /// Value at the representative instance
        value: f64,
    },
    /// Named function of variables that have no static value
    Function {
        /// Free variables, `$t` excluded
        dependencies: Vec<String>,
    },
}

impl SymbolKind {
    /// Short label for logs and listings
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::State => "state",
            SymbolKind::Coupling { .. } => "coupling",
            SymbolKind::Pulse => "pulse",
            SymbolKind::SineWave => "sinewave",
            SymbolKind::TimeVarying => "time-varying",
            SymbolKind::InitialCondition { .. } => "initial-condition",
            SymbolKind::Parameter { .. } => "parameter",
            SymbolKind::Function { .. } => "function",
        }
    }
}

/// Classification result for one equation
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDef {
    /// Equation this symbol defines
    pub key: EquationKey,
    /// Strategy
    pub kind: SymbolKind,
    /// Definition text differs per instance
    pub instance_specific: bool,
    /// First instance that selects this equation
    pub representative: Serial,
}

/// Everything classification needs to look at
#[derive(Clone, Copy)]
pub struct Environment<'a, 't> {
    /// Expanded network
    pub network: &'a Network<'t>,
    /// Expression evaluator
    pub evaluator: &'a dyn Evaluator,
    /// Device bindings per part
    pub devices: &'a BTreeMap<PartId, DeviceMapping>,
}

/// Memoized symbol definitions plus the "already emitted" side table
#[derive(Debug, Default)]
pub struct SymbolTable {
    defs: BTreeMap<EquationKey, Rc<SymbolDef>>,
    emitted: BTreeSet<EquationKey>,
}

impl SymbolTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `key` on first request; later requests return the same `Rc`
    pub fn resolve(&mut self, env: &Environment<'_, '_>, key: EquationKey) -> Result<Rc<SymbolDef>> {
        if let Some(def) = self.defs.get(&key) {
            return Ok(Rc::clone(def));
        }
        let def = Rc::new(classify(env, key)?);
        self.defs.insert(key, Rc::clone(&def));
        Ok(def)
    }

    /// Cached definition, if classified
    pub fn get(&self, key: &EquationKey) -> Option<&Rc<SymbolDef>> {
        self.defs.get(key)
    }

    /// Record an emission; true the first time for `key`
    pub fn mark_emitted(&mut self, key: EquationKey) -> bool {
        self.emitted.insert(key)
    }

    /// True once `key` has been emitted
    pub fn is_emitted(&self, key: &EquationKey) -> bool {
        self.emitted.contains(key)
    }

    /// Number of classified equations
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True if nothing was classified
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Classified definitions in key order
    pub fn iter(&self) -> impl Iterator<Item = &Rc<SymbolDef>> {
        self.defs.values()
    }
}

/// Classify one equation
pub fn classify(env: &Environment<'_, '_>, key: EquationKey) -> Result<SymbolDef> {
    let part = env.network.part(key.part);
    let var = &part.template.variables[key.variable];
    let eq = &var.equations[key.equation];
    let subject = format!("{}.{}", part.path, var.name);

    if var.order > 1 {
        return Err(CompilerError::translation(
            subject,
            format!("derivative order {} is not supported", var.order),
        ));
    }

    let representative = representative(env.network, env.evaluator, key.part, key.variable, key.equation)?;
    let specific = || instance_specific(env, key.part, &eq.expression);

    let (kind, instance_specific) = if !eq.initial && var.order == 1 {
        match coupling_target(env, key.part, &var.name, &subject)? {
            Some((endpoint, target)) => (SymbolKind::Coupling { endpoint, target }, true),
            None => (SymbolKind::State, true),
        }
    } else if !eq.initial && eq.expression.as_call_to(PULSE).is_some() {
        (SymbolKind::Pulse, specific())
    } else if !eq.initial && eq.expression.as_call_to(SINEWAVE).is_some() {
        (SymbolKind::SineWave, specific())
    } else if !eq.initial && eq.expression.mentions(TIME) {
        (SymbolKind::TimeVarying, specific())
    } else if eq.initial && var.equations.iter().any(|e| !e.initial) {
        let value = evaluate_at(env, representative, &eq.expression, Phase::Initial)
            .map_err(|e| CompilerError::translation(&subject, format!("initial condition: {}", e)))
            .and_then(|v| match v {
                Value::Scalar(x) => Ok(x),
                other => Err(CompilerError::translation(
                    &subject,
                    format!("initial condition must be a number, got {:?}", other),
                )),
            })?;
        (SymbolKind::InitialCondition { value }, specific())
    } else {
        let kind = match evaluate_at(env, representative, &eq.expression, Phase::of(eq)) {
            Ok(Value::Scalar(value)) => SymbolKind::Parameter { value },
            Ok(other) => {
                return Err(CompilerError::translation(
                    subject,
                    format!("unrecognized evaluation result {:?}", other),
                ))
            }
            Err(e) if e.is_not_evaluable() => {
                let dependencies: Vec<String> =
                    eq.expression.variables().into_iter().filter(|v| v != TIME).collect();
                if dependencies.is_empty() {
                    return Err(CompilerError::translation(
                        subject,
                        "expression cannot be evaluated and has no dependencies",
                    ));
                }
                SymbolKind::Function { dependencies }
            }
            Err(e) => return Err(CompilerError::translation(subject, e.to_string())),
        };
        (kind, specific())
    };

    debug!(
        "{} equation {}: {} ({})",
        subject,
        key.equation,
        kind.label(),
        if instance_specific { "per instance" } else { "shared" }
    );
    Ok(SymbolDef {
        key,
        kind,
        instance_specific,
        representative,
    })
}

fn evaluate_at(
    env: &Environment<'_, '_>,
    serial: Serial,
    expr: &Expr,
    phase: Phase,
) -> std::result::Result<Value, EvalError> {
    let instance = env
        .network
        .instance(serial)
        .ok_or_else(|| EvalError::Invalid(format!("instance {} does not exist", serial)))?;
    Scope::for_instance(env.network, env.evaluator, instance, phase).evaluate(expr)
}

// `<alias>.<var>` on a connection names a state variable of an endpoint.
fn coupling_target(
    env: &Environment<'_, '_>,
    part: PartId,
    name: &str,
    subject: &str,
) -> Result<Option<(usize, String)>> {
    let p = env.network.part(part);
    let PartKind::Connection { endpoints, .. } = &p.kind else {
        return Ok(None);
    };
    let Some((alias, target)) = name.split_once('.') else {
        return Ok(None);
    };
    let slot = p.alias_position(alias).ok_or_else(|| {
        CompilerError::translation(subject, format!("'{}' is not an alias of this connection", alias))
    })?;

    let endpoint = endpoints[slot];
    let template = env.network.part(endpoint).template;
    let is_state = template.variable(target).map(|v| v.order == 1).unwrap_or(false);
    let is_node = env
        .devices
        .get(&endpoint)
        .map(|m| m.node_of(target).is_some())
        .unwrap_or(false);
    if !is_state && !is_node {
        return Err(CompilerError::translation(
            subject,
            format!(
                "coupling target '{}' of part '{}' is neither a state variable nor a device node",
                target,
                env.network.part(endpoint).path
            ),
        ));
    }
    Ok(Some((slot, target.to_string())))
}

/// True if `expr`, rendered in part `part`, differs between instances
pub fn instance_specific(env: &Environment<'_, '_>, part: PartId, expr: &Expr) -> bool {
    let mut visited = BTreeSet::new();
    references_instance(env, part, expr, &mut visited)
}

fn references_instance(
    env: &Environment<'_, '_>,
    part: PartId,
    expr: &Expr,
    visited: &mut BTreeSet<String>,
) -> bool {
    let p = env.network.part(part);
    for name in expr.variables() {
        match name.as_str() {
            INDEX | POSITION => return true,
            TIME | POPULATION => continue,
            _ => {}
        }
        let is_alias = name
            .split_once('.')
            .map(|(prefix, _)| p.alias_position(prefix).is_some())
            .unwrap_or(false);
        if is_alias {
            return true;
        }

        // Ancestor variables render against one fixed instance.
        let Some((owner, v)) = env.network.owner_of(part, &name) else {
            continue;
        };
        if owner != part || !visited.insert(name.clone()) {
            continue;
        }
        let var = &p.template.variables[v];
        if var.order >= 1 || var.equations.iter().any(|e| e.condition.is_some()) {
            return true;
        }
        if env.devices.get(&part).map(|m| m.shadows(&var.name)).unwrap_or(false) {
            return true;
        }
        if var
            .equations
            .iter()
            .any(|e| references_instance(env, part, &e.expression, visited))
        {
            return true;
        }
    }
    false
}
