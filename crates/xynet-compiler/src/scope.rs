//! Per-instance evaluation context and conditional-equation selection

use std::cell::RefCell;
use std::rc::Rc;

use xynet_ir::eval::{EvalError, Result as EvalResult};
use xynet_ir::{Bindings, EquationEntry, EquationSet, Evaluator, Value, Variable};
use xynet_ir::{INDEX, POPULATION, POSITION, TIME};

use crate::error::{CompilerError, Result};
use crate::network::{Network, PartId, PartInstance, Serial};

// Variable being evaluated: owning part, bound instance index, variable index
type Frame = (PartId, Option<usize>, usize);

/// Which equations of a variable are candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Initial-condition equations
    Initial,
    /// Ordinary (non-initial) equations
    Update,
}

impl Phase {
    /// Phase an equation belongs to
    pub fn of(equation: &EquationEntry) -> Self {
        if equation.initial {
            Phase::Initial
        } else {
            Phase::Update
        }
    }
}

/// Name bindings for evaluating equations of one part, optionally bound to
/// an instance (index, position) and to the two endpoints of a connection
pub struct Scope<'a, 't> {
    network: &'a Network<'t>,
    evaluator: &'a dyn Evaluator,
    part: PartId,
    index: Option<usize>,
    position: Option<[f64; 3]>,
    endpoints: Option<[Serial; 2]>,
    phase: Phase,
    active: Rc<RefCell<Vec<Frame>>>,
}

impl<'a, 't> Scope<'a, 't> {
    fn new(network: &'a Network<'t>, evaluator: &'a dyn Evaluator, part: PartId, phase: Phase) -> Self {
        Self {
            network,
            evaluator,
            part,
            index: None,
            position: None,
            endpoints: None,
            phase,
            active: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Part-level scope with no instance bound
    pub fn for_part(network: &'a Network<'t>, evaluator: &'a dyn Evaluator, part: PartId, phase: Phase) -> Self {
        Self::new(network, evaluator, part, phase)
    }

    /// Scope for an instance that is about to be created
    pub fn for_index(network: &'a Network<'t>, evaluator: &'a dyn Evaluator, part: PartId, index: usize) -> Self {
        let mut s = Self::new(network, evaluator, part, Phase::Update);
        s.index = Some(index);
        s
    }

    /// Scope bound to an existing instance
    pub fn for_instance(
        network: &'a Network<'t>,
        evaluator: &'a dyn Evaluator,
        instance: &PartInstance,
        phase: Phase,
    ) -> Self {
        let mut s = Self::new(network, evaluator, instance.part, phase);
        s.index = Some(instance.index);
        s.position = instance.position();
        s.endpoints = instance.endpoints();
        s
    }

    /// Scope for a prospective connection between `pre` and `post`
    pub fn for_pair(
        network: &'a Network<'t>,
        evaluator: &'a dyn Evaluator,
        part: PartId,
        index: usize,
        pre: Serial,
        post: Serial,
    ) -> Self {
        let mut s = Self::new(network, evaluator, part, Phase::Update);
        s.index = Some(index);
        s.endpoints = Some([pre, post]);
        s
    }

    /// Template of the scoped part
    pub fn template(&self) -> &'t EquationSet {
        self.network.part(self.part).template
    }

    /// Evaluate an arbitrary expression in this scope
    pub fn evaluate(&self, expr: &xynet_ir::Expr) -> EvalResult<Value> {
        self.evaluator.evaluate(expr, self)
    }

    /// Evaluate a template variable by selecting its applicable equation.
    /// Reserved names are not special-cased here.
    pub fn evaluate_variable(&self, name: &str) -> EvalResult<Value> {
        let Some((owner, v)) = self.network.owner_of(self.part, name) else {
            return Err(EvalError::NotEvaluable(name.to_string()));
        };
        if owner != self.part {
            return self.ancestor_scope(owner).evaluate_variable(name);
        }

        let var = &self.template().variables[v];
        let phase = effective_phase(var, self.phase);
        // Integrated state only has a static value while setting initial conditions.
        if var.order >= 1 && phase == Phase::Update {
            return Err(EvalError::NotEvaluable(name.to_string()));
        }

        let frame = (self.part, self.index, v);
        if self.active.borrow().contains(&frame) {
            return Err(EvalError::Invalid(format!("definition cycle through '{}'", name)));
        }
        self.active.borrow_mut().push(frame);
        let result = match select_equation(var, phase, self) {
            Ok(Some(chosen)) => self.evaluate(&var.equations[chosen].expression),
            Ok(None) => Err(EvalError::NotEvaluable(name.to_string())),
            Err(e) => Err(e),
        };
        self.active.borrow_mut().pop();
        result
    }

    fn ancestor_scope(&self, owner: PartId) -> Scope<'a, 't> {
        let mut s = Self::new(self.network, self.evaluator, owner, self.phase);
        let first = self
            .network
            .part(owner)
            .first_serial()
            .and_then(|serial| self.network.instance(serial));
        if let Some(instance) = first {
            s.index = Some(instance.index);
            s.position = instance.position();
            s.endpoints = instance.endpoints();
        }
        s.active = Rc::clone(&self.active);
        s
    }

    fn endpoint_scope(&self, serial: Serial, name: &str) -> EvalResult<Scope<'a, 't>> {
        let instance = self
            .network
            .instance(serial)
            .ok_or_else(|| EvalError::Invalid(format!("endpoint {} of '{}' does not exist", serial, name)))?;
        let mut s = Self::for_instance(self.network, self.evaluator, instance, self.phase);
        s.active = Rc::clone(&self.active);
        Ok(s)
    }
}

impl Bindings for Scope<'_, '_> {
    fn lookup(&self, name: &str) -> EvalResult<Value> {
        match name {
            INDEX => self
                .index
                .map(|i| Value::Scalar(i as f64))
                .ok_or_else(|| EvalError::NotEvaluable(name.to_string())),
            POPULATION => match self.network.part(self.part).population {
                Some(n) => Ok(Value::Scalar(n as f64)),
                None if self.template().variable(POPULATION).is_some() => self.evaluate_variable(POPULATION),
                None => Ok(Value::Scalar(1.0)),
            },
            TIME => Err(EvalError::NotEvaluable(name.to_string())),
            POSITION => self
                .position
                .map(|p| Value::Array(p.to_vec()))
                .ok_or_else(|| EvalError::NotEvaluable(name.to_string())),
            _ => {
                if let Some((prefix, rest)) = name.split_once('.') {
                    if let Some(slot) = self.network.part(self.part).alias_position(prefix) {
                        return match self.endpoints {
                            Some(endpoints) => self.endpoint_scope(endpoints[slot], name)?.lookup(rest),
                            None => Err(EvalError::NotEvaluable(name.to_string())),
                        };
                    }
                }
                self.evaluate_variable(name)
            }
        }
    }
}

/// Indices of the candidate equations of `var` for `phase`
pub fn candidates(var: &Variable, phase: Phase) -> impl Iterator<Item = usize> + '_ {
    var.equations
        .iter()
        .enumerate()
        .filter(move |(_, e)| Phase::of(e) == phase)
        .map(|(i, _)| i)
}

/// Phase whose equations define `var` when `requested` is asked for. A
/// variable without candidates in one phase uses the other one.
pub fn effective_phase(var: &Variable, requested: Phase) -> Phase {
    if candidates(var, requested).next().is_some() {
        return requested;
    }
    match requested {
        Phase::Initial => Phase::Update,
        Phase::Update => Phase::Initial,
    }
}

/// Pick the equation of `var` that applies in `scope`: the first guarded
/// candidate whose guard holds, else the unguarded default.
pub fn select_equation(var: &Variable, phase: Phase, scope: &Scope<'_, '_>) -> EvalResult<Option<usize>> {
    let mut default = None;
    for i in candidates(var, phase) {
        if var.equations[i].condition.is_none() {
            if default.is_some() {
                return Err(EvalError::Invalid(format!(
                    "conflicting default equations for '{}'",
                    var.name
                )));
            }
            default = Some(i);
        }
    }

    for i in candidates(var, phase) {
        let Some(guard) = &var.equations[i].condition else {
            continue;
        };
        match scope.evaluate(guard) {
            Ok(v) if v.is_truthy() => return Ok(Some(i)),
            Ok(_) => {}
            Err(e) => {
                return Err(EvalError::Invalid(format!(
                    "guard of '{}' cannot be evaluated statically: {}",
                    var.name, e
                )))
            }
        }
    }
    Ok(default)
}

/// First instance of `part` whose selection for variable `variable` picks
/// equation `equation`
pub fn representative(
    network: &Network<'_>,
    evaluator: &dyn Evaluator,
    part: PartId,
    variable: usize,
    equation: usize,
) -> Result<Serial> {
    let p = network.part(part);
    let var = &p.template.variables[variable];
    let phase = Phase::of(&var.equations[equation]);

    for serial in &p.instances {
        let Some(instance) = network.instance(*serial) else {
            continue;
        };
        let scope = Scope::for_instance(network, evaluator, instance, phase);
        let chosen = select_equation(var, phase, &scope)
            .map_err(|e| CompilerError::network_generation(&p.path, e.to_string()))?;
        if chosen == Some(equation) {
            return Ok(*serial);
        }
    }
    Err(CompilerError::network_generation(
        &p.path,
        format!("no instance selects equation {} of '{}'", equation, var.name),
    ))
}
