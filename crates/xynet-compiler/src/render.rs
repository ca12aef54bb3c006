//! Rendering of symbols into netlist names, references and definition lines

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use xynet_ir::expr::format_number;
use xynet_ir::{BinaryOp, Expr, ExprWriter, Value, INDEX, POPULATION, POSITION, PULSE, SINEWAVE, TIME};

use crate::device::DeviceMapping;
use crate::error::{CompilerError, Result};
use crate::network::{Network, PartId, PartInstance, Serial};
use crate::scope::{effective_phase, select_equation, Phase, Scope};
use crate::symbols::{EquationKey, Environment, SymbolDef, SymbolKind, SymbolTable};

/// Replace every character outside `[A-Za-z0-9_]` with `_`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Pow => "**",
        BinaryOp::And => "&",
        BinaryOp::Or => "|",
        other => other.symbol(),
    }
}

fn waveform_misuse(name: &str) -> CompilerError {
    CompilerError::translation(name, "waveform generators must be the whole right-hand side")
}

/// Drives symbol resolution and emits text for one network
pub struct Translator<'a, 't> {
    env: Environment<'a, 't>,
    symbols: SymbolTable,
    models: BTreeSet<PartId>,
    // node -> value already given by an `.ic` line
    initial_nodes: BTreeMap<String, String>,
}

impl<'a, 't> Translator<'a, 't> {
    /// New translator with an empty symbol table
    pub fn new(env: Environment<'a, 't>) -> Self {
        Self {
            env,
            symbols: SymbolTable::new(),
            models: BTreeSet::new(),
            initial_nodes: BTreeMap::new(),
        }
    }

    /// Network being translated
    pub fn network(&self) -> &'a Network<'t> {
        self.env.network
    }

    /// Device bindings of a part
    pub fn device(&self, part: PartId) -> Option<&'a DeviceMapping> {
        self.env.devices.get(&part)
    }

    /// Symbol table built so far
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Memoized classification
    pub fn symbol(&mut self, key: EquationKey) -> Result<Rc<SymbolDef>> {
        self.symbols.resolve(&self.env, key)
    }

    fn instance(&self, serial: Serial) -> Result<&'a PartInstance> {
        self.env
            .network
            .instance(serial)
            .ok_or_else(|| CompilerError::translation(serial.to_string(), "no such instance"))
    }

    fn subject(&self, part: PartId, variable: &str) -> String {
        format!("{}.{}", self.env.network.part(part).path, variable)
    }

    /// Equation of variable `variable` that applies to `instance` in `phase`
    pub fn select(&self, instance: &PartInstance, variable: usize, phase: Phase) -> Result<Option<usize>> {
        let part = self.env.network.part(instance.part);
        let var = &part.template.variables[variable];
        let scope = Scope::for_instance(self.env.network, self.env.evaluator, instance, phase);
        select_equation(var, phase, &scope).map_err(|e| CompilerError::network_generation(&part.path, e.to_string()))
    }

    // ---------------------------------------------------------------- names

    /// Per-instance node of a variable
    pub fn instance_node(serial: Serial, variable: &str) -> String {
        format!("n{}_{}", serial, sanitize(variable))
    }

    fn shared_stem(&self, key: EquationKey) -> String {
        let part = self.env.network.part(key.part);
        let var = &part.template.variables[key.variable];
        let mut stem = format!("{}_{}", sanitize(&part.path), sanitize(&var.name));
        if var.equations.len() > 1 {
            stem.push_str(&format!("_{}", key.equation));
        }
        stem
    }

    fn variable_name(&self, key: EquationKey) -> &'t str {
        &self.env.network.part(key.part).template.variables[key.variable].name
    }

    fn node_name(&self, def: &SymbolDef, serial: Serial) -> String {
        if def.instance_specific {
            Self::instance_node(serial, self.variable_name(def.key))
        } else {
            format!("s_{}", self.shared_stem(def.key))
        }
    }

    fn param_name(&self, def: &SymbolDef, serial: Serial) -> String {
        if def.instance_specific {
            format!("p{}_{}", serial, sanitize(self.variable_name(def.key)))
        } else {
            format!("p_{}", self.shared_stem(def.key))
        }
    }

    fn function_name(&self, def: &SymbolDef, serial: Serial) -> String {
        if def.instance_specific {
            format!("f{}_{}", serial, sanitize(self.variable_name(def.key)))
        } else {
            format!("f_{}", self.shared_stem(def.key))
        }
    }

    fn initial_param_name(&self, key: EquationKey) -> String {
        format!("ic_{}", self.shared_stem(key))
    }

    /// Node carrying the voltage of `variable` in an instance, following endpoint aliases
    pub fn variable_node(&self, serial: Serial, variable: &str) -> Result<String> {
        let instance = self.instance(serial)?;
        let part = self.env.network.part(instance.part);
        if let Some((prefix, rest)) = variable.split_once('.') {
            if let Some(slot) = part.alias_position(prefix) {
                if let Some(endpoints) = instance.endpoints() {
                    return self.variable_node(endpoints[slot], rest);
                }
            }
        }
        Ok(Self::instance_node(serial, variable))
    }

    /// Node `k` of an instance's device. Unbound terminals of a connection
    /// device attach to the membrane node of endpoint `k`.
    pub fn device_node(&self, serial: Serial, mapping: &DeviceMapping, k: usize) -> Result<String> {
        if let Some(variable) = mapping.nodes.get(&k) {
            return self.variable_node(serial, variable);
        }
        if mapping.spec.connection {
            return self.endpoint_node(serial, mapping, k);
        }
        match mapping.spec.nodes.get(k) {
            Some(&"0") => Ok("0".to_string()),
            Some(placeholder) => Ok(placeholder.replace("{}", &format!("n{}", serial))),
            None => Err(CompilerError::translation(
                mapping.spec.name,
                format!("node index {} is out of range", k),
            )),
        }
    }

    fn endpoint_node(&self, serial: Serial, mapping: &DeviceMapping, k: usize) -> Result<String> {
        let instance = self.instance(serial)?;
        let subject = || format!("{} node {}", self.env.network.part(instance.part).path, k);
        let endpoint = instance
            .endpoints()
            .and_then(|e| e.get(k).copied())
            .ok_or_else(|| {
                CompilerError::translation(
                    subject(),
                    format!("device '{}' has no endpoint for this node", mapping.spec.name),
                )
            })?;
        let target = self.instance(endpoint)?;
        let target_mapping = self.device(target.part).ok_or_else(|| {
            CompilerError::translation(
                subject(),
                format!(
                    "endpoint part '{}' has no device; bind the node with {}",
                    self.env.network.part(target.part).path,
                    crate::device::NODE_TAG
                ),
            )
        })?;
        let membrane = target_mapping.spec.membrane_node().ok_or_else(|| {
            CompilerError::translation(
                subject(),
                format!("device '{}' has no node to attach to", target_mapping.spec.name),
            )
        })?;
        self.device_node(endpoint, target_mapping, membrane)
    }

    // ----------------------------------------------------------- references

    /// Render a reference to `name` as seen from instance `serial`
    pub fn reference(&mut self, serial: Serial, name: &str, phase: Phase) -> Result<String> {
        let instance = self.instance(serial)?;
        let part = self.env.network.part(instance.part);

        match name {
            TIME => return Ok("TIME".to_string()),
            INDEX => return Ok(format_number(instance.index as f64)),
            POPULATION => {
                let n = part.population.unwrap_or(part.instances.len());
                return Ok(format_number(n as f64));
            }
            POSITION => {
                return Err(CompilerError::translation(
                    self.subject(instance.part, name),
                    "a position vector cannot appear in a netlist expression",
                ))
            }
            _ => {}
        }

        if let Some((prefix, rest)) = name.split_once('.') {
            if let Some(slot) = part.alias_position(prefix) {
                let endpoints = instance.endpoints().ok_or_else(|| {
                    CompilerError::translation(self.subject(instance.part, name), "instance has no endpoints")
                })?;
                return self.reference(endpoints[slot], rest, phase);
            }
        }

        let (owner, v) = self
            .env
            .network
            .owner_of(instance.part, name)
            .ok_or_else(|| CompilerError::translation(self.subject(instance.part, name), "unknown variable"))?;
        if owner != instance.part {
            let first = self.env.network.part(owner).first_serial().ok_or_else(|| {
                CompilerError::translation(self.subject(owner, name), "part has no instances")
            })?;
            return self.reference(first, name, phase);
        }

        if let Some(mapping) = self.device(instance.part) {
            if let Some(k) = mapping.node_of(name) {
                return Ok(format!("V({})", self.device_node(serial, mapping, k)?));
            }
            if let Some(internal) = mapping.internal_of(name) {
                return Ok(format!("N({}:{})", DeviceMapping::instance_name(serial), internal));
            }
        }

        let var = &part.template.variables[v];
        if var.order >= 1 {
            return Ok(format!("V({})", Self::instance_node(serial, name)));
        }

        let equation = self.select(instance, v, effective_phase(var, phase))?.ok_or_else(|| {
            CompilerError::translation(
                self.subject(instance.part, name),
                format!("no equation applies to instance {}", serial),
            )
        })?;
        let def = self.symbol(EquationKey {
            part: instance.part,
            variable: v,
            equation,
        })?;
        self.symbol_reference(&def, instance, Phase::of(&var.equations[equation]))
    }

    fn symbol_reference(&mut self, def: &SymbolDef, instance: &PartInstance, phase: Phase) -> Result<String> {
        let serial = instance.serial;
        match &def.kind {
            SymbolKind::State | SymbolKind::Coupling { .. } => Ok(format!(
                "V({})",
                Self::instance_node(serial, self.variable_name(def.key))
            )),
            SymbolKind::Pulse | SymbolKind::SineWave | SymbolKind::TimeVarying => {
                Ok(format!("V({})", self.node_name(def, serial)))
            }
            SymbolKind::InitialCondition { .. } if def.instance_specific => {
                let value = self.scalar_at(instance, def.key, Phase::Initial)?;
                Ok(format_number(value))
            }
            SymbolKind::InitialCondition { .. } => Ok(self.initial_param_name(def.key)),
            SymbolKind::Parameter { .. } => Ok(self.param_name(def, serial)),
            SymbolKind::Function { dependencies } => {
                let mut args = Vec::with_capacity(dependencies.len());
                for dep in dependencies {
                    args.push(self.reference(serial, dep, phase)?);
                }
                Ok(format!("{}({})", self.function_name(def, serial), args.join(", ")))
            }
        }
    }

    /// Render an expression as seen from instance `serial`
    pub fn expression(&mut self, serial: Serial, expr: &Expr, phase: Phase) -> Result<String> {
        let mut writer = InstanceWriter {
            translator: self,
            serial,
            phase,
        };
        expr.write(&mut writer)
    }

    fn scalar_at(&self, instance: &PartInstance, key: EquationKey, phase: Phase) -> Result<f64> {
        let part = self.env.network.part(key.part);
        let var = &part.template.variables[key.variable];
        let scope = Scope::for_instance(self.env.network, self.env.evaluator, instance, phase);
        match scope.evaluate(&var.equations[key.equation].expression) {
            Ok(Value::Scalar(v)) => Ok(v),
            Ok(other) => Err(CompilerError::translation(
                self.subject(key.part, &var.name),
                format!("expected a number for instance {}, got {:?}", instance.serial, other),
            )),
            Err(e) => Err(CompilerError::translation(
                self.subject(key.part, &var.name),
                format!("instance {}: {}", instance.serial, e),
            )),
        }
    }

    // ---------------------------------------------------------- definitions

    /// Netlist lines defining equation `key` for instance `serial`. Shared
    /// definitions produce lines only the first time.
    pub fn definition(&mut self, serial: Serial, key: EquationKey) -> Result<Vec<String>> {
        let def = self.symbol(key)?;
        let first = self.symbols.mark_emitted(key);
        let instance = self.instance(serial)?;
        let var = &self.env.network.part(key.part).template.variables[key.variable];
        let eq = &var.equations[key.equation];
        let phase = Phase::of(eq);
        let subject = self.subject(key.part, &var.name);

        if let SymbolKind::InitialCondition { value } = def.kind {
            let node = self.initial_target(serial, key)?;
            let mut lines = Vec::new();
            let assigned = if def.instance_specific {
                format_number(self.scalar_at(instance, key, Phase::Initial)?)
            } else {
                let name = self.initial_param_name(key);
                if first {
                    lines.push(format!(".param {}={}", name, format_number(value)));
                }
                format!("{{{}}}", name)
            };
            match self.initial_nodes.get(&node) {
                Some(previous) if *previous == assigned => {}
                Some(previous) => {
                    return Err(CompilerError::translation(
                        subject,
                        format!("node {} already starts at {}, not {}", node, previous, assigned),
                    ))
                }
                None => {
                    lines.push(format!(".ic V({})={}", node, assigned));
                    self.initial_nodes.insert(node, assigned);
                }
            }
            return Ok(lines);
        }

        if !def.instance_specific && !first {
            return Ok(Vec::new());
        }

        let lines = match &def.kind {
            SymbolKind::State => {
                let node = Self::instance_node(serial, &var.name);
                let rhs = self.expression(serial, &eq.expression, phase)?;
                vec![
                    format!("C{} {} 0 1", node, node),
                    format!("B{} 0 {} I={{{}}}", node, node, rhs),
                ]
            }
            SymbolKind::Coupling { endpoint, target } => {
                let endpoints = instance.endpoints().ok_or_else(|| {
                    CompilerError::translation(&subject, "instance has no endpoints")
                })?;
                let node = self.variable_node(endpoints[*endpoint], target)?;
                let rhs = self.expression(serial, &eq.expression, phase)?;
                vec![format!("Bc{}_{} 0 {} I={{{}}}", serial, sanitize(&var.name), node, rhs)]
            }
            SymbolKind::Pulse => {
                let node = self.node_name(&def, serial);
                let args = eq.expression.as_call_to(PULSE).unwrap_or(&[]);
                let rendered = self.pulse_args(serial, args, &subject, phase)?;
                vec![format!("V{} {} 0 PULSE({})", node, node, rendered)]
            }
            SymbolKind::SineWave => {
                let node = self.node_name(&def, serial);
                let args = eq.expression.as_call_to(SINEWAVE).unwrap_or(&[]);
                let rendered = self.sine_args(serial, args, &subject, phase)?;
                vec![format!("V{} {} 0 SIN({})", node, node, rendered)]
            }
            SymbolKind::TimeVarying => {
                let node = self.node_name(&def, serial);
                let rhs = self.expression(serial, &eq.expression, phase)?;
                vec![format!("B{} {} 0 V={{{}}}", node, node, rhs)]
            }
            SymbolKind::Parameter { value } => {
                let v = if def.instance_specific {
                    self.scalar_at(instance, key, phase)?
                } else {
                    *value
                };
                vec![format!(".param {}={}", self.param_name(&def, serial), format_number(v))]
            }
            SymbolKind::Function { dependencies } => {
                let args: Vec<String> = dependencies.iter().map(|d| format!("a_{}", sanitize(d))).collect();
                let body = eq.expression.write(&mut BodyWriter)?;
                vec![format!(
                    ".func {}({}) {{{}}}",
                    self.function_name(&def, serial),
                    args.join(","),
                    body
                )]
            }
            SymbolKind::InitialCondition { .. } => Vec::new(),
        };
        Ok(lines)
    }

    /// Node an initial condition on the variable of `key` applies to: the
    /// device node it is bound to, or the node its update equation drives
    fn initial_target(&mut self, serial: Serial, key: EquationKey) -> Result<String> {
        let instance = self.instance(serial)?;
        let var = &self.env.network.part(key.part).template.variables[key.variable];
        let subject = self.subject(key.part, &var.name);

        if let Some(mapping) = self.device(key.part) {
            if let Some(k) = mapping.node_of(&var.name) {
                return self.device_node(serial, mapping, k);
            }
            if mapping.internal_of(&var.name).is_some() {
                return Err(CompilerError::translation(
                    subject,
                    "device internal variables cannot take an initial condition",
                ));
            }
        }
        if var.order >= 1 {
            return self.variable_node(serial, &var.name);
        }

        let equation = self.select(instance, key.variable, Phase::Update)?.ok_or_else(|| {
            CompilerError::translation(&subject, format!("no update equation applies to instance {}", serial))
        })?;
        let def = self.symbol(EquationKey { equation, ..key })?;
        match def.kind {
            SymbolKind::State | SymbolKind::Coupling { .. } => self.variable_node(serial, &var.name),
            SymbolKind::Pulse | SymbolKind::SineWave | SymbolKind::TimeVarying => Ok(self.node_name(&def, serial)),
            _ => Err(CompilerError::translation(
                subject,
                format!("a {} has no node to take an initial condition", def.kind.label()),
            )),
        }
    }

    fn waveform_arg(&mut self, serial: Serial, arg: Option<&Expr>, default: f64, phase: Phase) -> Result<String> {
        match arg {
            None => Ok(format_number(default)),
            Some(Expr::Num(v)) => Ok(format_number(*v)),
            Some(e) => Ok(format!("{{{}}}", self.expression(serial, e, phase)?)),
        }
    }

    // pulse(width[, period[, rise[, fall[, delay[, low[, high]]]]]])
    fn pulse_args(&mut self, serial: Serial, args: &[Expr], subject: &str, phase: Phase) -> Result<String> {
        if args.is_empty() || args.len() > 7 {
            return Err(CompilerError::translation(
                subject,
                format!("pulse expects 1 to 7 arguments, got {}", args.len()),
            ));
        }
        let width = self.waveform_arg(serial, args.first(), 0.0, phase)?;
        let rise = self.waveform_arg(serial, args.get(2), 0.0, phase)?;
        let fall = self.waveform_arg(serial, args.get(3), 0.0, phase)?;
        let delay = self.waveform_arg(serial, args.get(4), 0.0, phase)?;
        let low = self.waveform_arg(serial, args.get(5), 0.0, phase)?;
        let high = self.waveform_arg(serial, args.get(6), 1.0, phase)?;
        let mut out = format!("{} {} {} {} {} {}", low, high, delay, rise, fall, width);
        // Without a period the pulse fires once.
        if let Some(period) = args.get(1) {
            out.push(' ');
            out.push_str(&self.waveform_arg(serial, Some(period), 0.0, phase)?);
        }
        Ok(out)
    }

    // sinewave(amplitude, frequency[, offset[, delay[, damping[, phase]]]])
    fn sine_args(&mut self, serial: Serial, args: &[Expr], subject: &str, phase: Phase) -> Result<String> {
        if args.len() < 2 || args.len() > 6 {
            return Err(CompilerError::translation(
                subject,
                format!("sinewave expects 2 to 6 arguments, got {}", args.len()),
            ));
        }
        let amplitude = self.waveform_arg(serial, args.first(), 0.0, phase)?;
        let frequency = self.waveform_arg(serial, args.get(1), 0.0, phase)?;
        let offset = self.waveform_arg(serial, args.get(2), 0.0, phase)?;
        let delay = self.waveform_arg(serial, args.get(3), 0.0, phase)?;
        let damping = self.waveform_arg(serial, args.get(4), 0.0, phase)?;
        let shift = self.waveform_arg(serial, args.get(5), 0.0, phase)?;
        Ok(format!(
            "{} {} {} {} {} {}",
            offset, amplitude, frequency, delay, damping, shift
        ))
    }

    // -------------------------------------------------------------- devices

    /// Device lines for one instance: the shared `.model` line before the
    /// part's first instance, the instance line, then input injections
    pub fn device_lines(&mut self, serial: Serial, mapping: &DeviceMapping) -> Result<Vec<String>> {
        let instance = self.instance(serial)?;
        let part = self.env.network.part(instance.part);
        let model = DeviceMapping::model_name(part);
        let mut lines = Vec::new();

        let mut shared = Vec::new();
        let mut specific = Vec::new();
        for (param, variable) in &mapping.params {
            let value = self.reference(serial, variable, Phase::Update)?;
            if self.param_is_shared(instance, variable)? {
                shared.push(format!("{}={{{}}}", param, value));
            } else {
                specific.push(format!("{}={{{}}}", param, value));
            }
        }

        if self.models.insert(instance.part) {
            let mut line = format!(".model {} {} level={}", model, mapping.spec.model, mapping.spec.level);
            for s in &shared {
                line.push(' ');
                line.push_str(s);
            }
            lines.push(line);
        }

        let mut nodes = Vec::with_capacity(mapping.spec.nodes.len());
        for k in 0..mapping.spec.nodes.len() {
            nodes.push(self.device_node(serial, mapping, k)?);
        }
        let mut line = format!(
            "{} {} {} {}",
            mapping.spec.device,
            DeviceMapping::instance_name(serial),
            nodes.join(" "),
            model
        );
        for s in &specific {
            line.push(' ');
            line.push_str(s);
        }
        lines.push(line);

        for (variable, k) in &mapping.inputs {
            let node = self.device_node(serial, mapping, *k)?;
            let current = self.reference(serial, variable, Phase::Update)?;
            lines.push(format!("Bi{}_{} 0 {} I={{{}}}", serial, sanitize(variable), node, current));
        }
        Ok(lines)
    }

    fn param_is_shared(&mut self, instance: &PartInstance, variable: &str) -> Result<bool> {
        let part = self.env.network.part(instance.part);
        let Some(v) = part.template.variable_index(variable) else {
            return Ok(true);
        };
        let var = &part.template.variables[v];
        if var.order >= 1 || var.equations.iter().any(|e| e.condition.is_some()) {
            return Ok(false);
        }
        match self.select(instance, v, Phase::Update)? {
            Some(equation) => {
                let def = self.symbol(EquationKey {
                    part: instance.part,
                    variable: v,
                    equation,
                })?;
                Ok(!def.instance_specific)
            }
            None => Ok(true),
        }
    }
}

struct InstanceWriter<'w, 'a, 't> {
    translator: &'w mut Translator<'a, 't>,
    serial: Serial,
    phase: Phase,
}

impl ExprWriter for InstanceWriter<'_, '_, '_> {
    type Error = CompilerError;

    fn variable(&mut self, name: &str) -> Result<String> {
        self.translator.reference(self.serial, name, self.phase)
    }

    fn function(&mut self, name: &str, args: Vec<String>) -> Result<String> {
        if name == PULSE || name == SINEWAVE {
            return Err(waveform_misuse(name));
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }

    fn vector(&mut self, _items: Vec<String>) -> Result<String> {
        Err(CompilerError::translation(
            self.serial.to_string(),
            "vector literals cannot appear in a netlist expression",
        ))
    }

    fn binary_op(&self, op: BinaryOp) -> &'static str {
        operator(op)
    }
}

// Function bodies name their dependencies as `a_<name>` arguments.
struct BodyWriter;

impl ExprWriter for BodyWriter {
    type Error = CompilerError;

    fn variable(&mut self, name: &str) -> Result<String> {
        if name == TIME {
            Ok("TIME".to_string())
        } else {
            Ok(format!("a_{}", sanitize(name)))
        }
    }

    fn function(&mut self, name: &str, args: Vec<String>) -> Result<String> {
        if name == PULSE || name == SINEWAVE {
            return Err(waveform_misuse(name));
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }

    fn vector(&mut self, _items: Vec<String>) -> Result<String> {
        Err(CompilerError::translation(
            "function body",
            "vector literals cannot appear in a netlist expression",
        ))
    }

    fn binary_op(&self, op: BinaryOp) -> &'static str {
        operator(op)
    }
}
