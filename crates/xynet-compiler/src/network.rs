//! Network instantiation: expands the template tree into serially numbered instances

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use xynet_ir::{EquationSet, Evaluator, Value, POPULATION, POSITION, PROBABILITY};

use crate::error::{CompilerError, Result};
use crate::scope::{Phase, Scope};

/// Globally unique instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(pub u64);

impl Serial {
    /// Create a new serial
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic serial allocator threaded through instantiation
#[derive(Debug, Clone)]
pub struct SerialCounter {
    next: u64,
}

impl SerialCounter {
    /// Counter whose first serial is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose first serial is `first`
    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    /// Allocate the next serial
    pub fn next_serial(&mut self) -> Serial {
        let s = Serial(self.next);
        self.next += 1;
        s
    }

    /// Serial the next allocation will return
    pub fn peek(&self) -> Serial {
        Serial(self.next)
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of a part in [`Network::parts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId(pub usize);

impl PartId {
    /// Position in the part list
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// What a part expands into
#[derive(Debug, Clone, PartialEq)]
pub enum PartKind {
    /// Population of compartments
    Compartment,
    /// Probabilistic links between two compartment parts
    Connection {
        /// Binding aliases, pre side first
        aliases: [String; 2],
        /// Resolved endpoint parts, pre side first
        endpoints: [PartId; 2],
    },
}

/// Kind-specific instance payload
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceKind {
    /// Compartment with its evaluated position
    Compartment {
        /// Position, zero-padded to three components
        position: [f64; 3],
    },
    /// Connection between two compartment instances
    Connection {
        /// Pre-side instance
        pre: Serial,
        /// Post-side instance
        post: Serial,
    },
}

/// One concrete instance
#[derive(Debug, Clone, PartialEq)]
pub struct PartInstance {
    /// Serial number
    pub serial: Serial,
    /// Owning part
    pub part: PartId,
    /// Index within the owning part
    pub index: usize,
    /// Payload
    pub kind: InstanceKind,
}

impl PartInstance {
    /// Endpoint serials of a connection instance, pre side first
    pub fn endpoints(&self) -> Option<[Serial; 2]> {
        match self.kind {
            InstanceKind::Connection { pre, post } => Some([pre, post]),
            InstanceKind::Compartment { .. } => None,
        }
    }

    /// Position of a compartment instance
    pub fn position(&self) -> Option<[f64; 3]> {
        match self.kind {
            InstanceKind::Compartment { position } => Some(position),
            InstanceKind::Connection { .. } => None,
        }
    }
}

/// Reference to one equation inside a part's template
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EquationRef {
    /// Variable index in the template
    pub variable: usize,
    /// Equation index in the variable
    pub equation: usize,
}

/// Expanded template
#[derive(Debug, Clone)]
pub struct PartSet<'t> {
    /// Id (position in the part list)
    pub id: PartId,
    /// Dotted path from the root
    pub path: String,
    /// Template this part was expanded from
    pub template: &'t EquationSet,
    /// Enclosing part
    pub parent: Option<PartId>,
    /// Compartment or connection
    pub kind: PartKind,
    /// Instance serials in creation order
    pub instances: Vec<Serial>,
    /// Realized population, known once the part is instantiated
    pub population: Option<usize>,
    /// Equations flagged as initial conditions
    pub initial_equations: Vec<EquationRef>,
    /// Realized links, connections only
    pub adjacency: Option<Adjacency>,
}

impl<'t> PartSet<'t> {
    /// Leaf name
    pub fn name(&self) -> &'t str {
        &self.template.name
    }

    /// First instance serial, if any
    pub fn first_serial(&self) -> Option<Serial> {
        self.instances.first().copied()
    }

    /// True for connection parts
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, PartKind::Connection { .. })
    }

    /// Endpoint position (0 = pre, 1 = post) for a binding alias
    pub fn alias_position(&self, alias: &str) -> Option<usize> {
        match &self.kind {
            PartKind::Connection { aliases, .. } => aliases.iter().position(|a| a == alias),
            PartKind::Compartment => None,
        }
    }
}

/// Sparse `(pre, post) -> connection serials` map for one connection part
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Adjacency {
    pre: Vec<Serial>,
    post: Vec<Serial>,
    links: BTreeMap<(Serial, Serial), Vec<Serial>>,
}

impl Adjacency {
    /// Empty map over the given endpoint populations
    pub fn new(pre: Vec<Serial>, post: Vec<Serial>) -> Self {
        Self {
            pre,
            post,
            links: BTreeMap::new(),
        }
    }

    /// Record a realized connection
    pub fn record(&mut self, pre: Serial, post: Serial, connection: Serial) {
        self.links.entry((pre, post)).or_default().push(connection);
    }

    /// Connections realizing `pre -> post`
    pub fn get(&self, pre: Serial, post: Serial) -> &[Serial] {
        self.links.get(&(pre, post)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of realized connections
    pub fn len(&self) -> usize {
        self.links.values().map(Vec::len).sum()
    }

    /// True if nothing was realized
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Iterate `((pre, post), connections)` in serial order
    pub fn iter(&self) -> impl Iterator<Item = (&(Serial, Serial), &Vec<Serial>)> {
        self.links.iter()
    }

    /// Tab-separated matrix: rows are post instances, columns pre instances,
    /// cells the connection serials joined by `,` or `0`
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for post in &self.post {
            let row: Vec<String> = self
                .pre
                .iter()
                .map(|pre| {
                    let cell = self.get(*pre, *post);
                    if cell.is_empty() {
                        "0".to_string()
                    } else {
                        cell.iter().map(Serial::to_string).collect::<Vec<_>>().join(",")
                    }
                })
                .collect();
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }
}

/// Fully enumerated instance population
#[derive(Debug, Clone)]
pub struct Network<'t> {
    /// Parts in depth-first template order
    pub parts: Vec<PartSet<'t>>,
    instances: Vec<PartInstance>,
    base: u64,
}

impl<'t> Network<'t> {
    /// Part by id
    pub fn part(&self, id: PartId) -> &PartSet<'t> {
        &self.parts[id.0]
    }

    /// Instance by serial
    pub fn instance(&self, serial: Serial) -> Option<&PartInstance> {
        let offset = serial.0.checked_sub(self.base)?;
        self.instances.get(usize::try_from(offset).ok()?)
    }

    /// All instances in serial order
    pub fn instances(&self) -> &[PartInstance] {
        &self.instances
    }

    /// Part lookup by full dotted path
    pub fn find_part(&self, path: &str) -> Option<&PartSet<'t>> {
        self.parts.iter().find(|p| p.path == path)
    }

    /// Nearest part (self first, then ancestors) declaring variable `name`
    pub fn owner_of(&self, part: PartId, name: &str) -> Option<(PartId, usize)> {
        let mut cursor = Some(part);
        while let Some(id) = cursor {
            let p = self.part(id);
            if let Some(v) = p.template.variable_index(name) {
                return Some((id, v));
            }
            cursor = p.parent;
        }
        None
    }

    /// Serials per part path
    pub fn serials(&self) -> BTreeMap<String, Vec<u64>> {
        self.parts
            .iter()
            .map(|p| (p.path.clone(), p.instances.iter().map(Serial::raw).collect()))
            .collect()
    }

    /// Adjacency per connection part path
    pub fn adjacency(&self) -> BTreeMap<String, Adjacency> {
        self.parts
            .iter()
            .filter_map(|p| p.adjacency.as_ref().map(|a| (p.path.clone(), a.clone())))
            .collect()
    }

    fn push_instance(&mut self, instance: PartInstance) {
        debug_assert_eq!(instance.serial.0, self.base + self.instances.len() as u64);
        let part = instance.part;
        let serial = instance.serial;
        self.instances.push(instance);
        self.parts[part.0].instances.push(serial);
    }
}

/// Expand `template` into a network. Compartment parts are instantiated first,
/// then connection parts, each group in depth-first template order.
pub fn instantiate<'t, R: Rng + ?Sized>(
    template: &'t EquationSet,
    evaluator: &dyn Evaluator,
    rng: &mut R,
    counter: &mut SerialCounter,
) -> Result<Network<'t>> {
    let mut network = Network {
        parts: flatten(template)?,
        instances: Vec::new(),
        base: counter.peek().0,
    };

    let (compartments, connections): (Vec<PartId>, Vec<PartId>) = network
        .parts
        .iter()
        .map(|p| p.id)
        .partition(|id| !network.part(*id).is_connection());

    for id in compartments {
        instantiate_compartments(&mut network, evaluator, id, counter)?;
    }
    for id in connections {
        instantiate_connections(&mut network, evaluator, id, rng, counter)?;
    }

    info!(
        "Instantiated {} parts, {} instances",
        network.parts.len(),
        network.instances.len()
    );
    Ok(network)
}

struct FlatPart<'t> {
    template: &'t EquationSet,
    path: String,
    parent: Option<PartId>,
}

fn flatten(template: &EquationSet) -> Result<Vec<PartSet<'_>>> {
    let mut flat = Vec::new();
    flatten_into(template, None, &mut flat)?;

    let mut parts = Vec::with_capacity(flat.len());
    for (i, fp) in flat.iter().enumerate() {
        let kind = if fp.template.is_connection() {
            resolve_bindings(&flat, i)?
        } else {
            PartKind::Compartment
        };
        let initial_equations = fp
            .template
            .variables
            .iter()
            .enumerate()
            .flat_map(|(v, var)| {
                var.equations
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.initial)
                    .map(move |(e, _)| EquationRef { variable: v, equation: e })
            })
            .collect();
        parts.push(PartSet {
            id: PartId(i),
            path: fp.path.clone(),
            template: fp.template,
            parent: fp.parent,
            kind,
            instances: Vec::new(),
            population: None,
            initial_equations,
            adjacency: None,
        });
    }
    Ok(parts)
}

fn flatten_into<'t>(
    template: &'t EquationSet,
    parent: Option<PartId>,
    flat: &mut Vec<FlatPart<'t>>,
) -> Result<()> {
    let path = match parent {
        Some(p) => format!("{}.{}", flat[p.0].path, template.name),
        None => template.name.clone(),
    };
    let id = PartId(flat.len());
    flat.push(FlatPart { template, path, parent });

    let mut seen = BTreeSet::new();
    for child in &template.parts {
        if !seen.insert(child.name.as_str()) {
            return Err(CompilerError::network_generation(
                format!("{}.{}", flat[id.0].path, child.name),
                "duplicate part name among siblings",
            ));
        }
    }
    for child in &template.parts {
        flatten_into(child, Some(id), flat)?;
    }
    Ok(())
}

fn resolve_bindings(flat: &[FlatPart<'_>], conn: usize) -> Result<PartKind> {
    let fp = &flat[conn];
    let bindings = &fp.template.connection_bindings;
    if bindings.len() != 2 {
        return Err(CompilerError::network_generation(
            &fp.path,
            format!("a connection needs exactly 2 bindings, found {}", bindings.len()),
        ));
    }

    let mut endpoints = [PartId(0); 2];
    for (slot, binding) in bindings.iter().enumerate() {
        let target = resolve_target(flat, fp.parent, &binding.target).ok_or_else(|| {
            CompilerError::network_generation(
                &fp.path,
                format!("alias not found: {} -> {}", binding.alias, binding.target),
            )
        })?;
        if flat[target].template.is_connection() {
            return Err(CompilerError::network_generation(
                &fp.path,
                format!(
                    "alias {} resolves to connection part '{}'",
                    binding.alias, flat[target].path
                ),
            ));
        }
        endpoints[slot] = PartId(target);
    }

    Ok(PartKind::Connection {
        aliases: [bindings[0].alias.clone(), bindings[1].alias.clone()],
        endpoints,
    })
}

// The first path segment is searched among the children of `level`, then of each
// enclosing level (the root sits above the outermost level); later segments descend.
fn resolve_target(flat: &[FlatPart<'_>], level: Option<PartId>, target: &str) -> Option<usize> {
    let mut segments = target.split('.');
    let first = segments.next()?;

    let mut cursor = level;
    let mut current = loop {
        if let Some(hit) = child_named(flat, cursor, first) {
            break hit;
        }
        cursor = flat[cursor?.0].parent;
    };
    for segment in segments {
        current = child_named(flat, Some(PartId(current)), segment)?;
    }
    Some(current)
}

fn child_named(flat: &[FlatPart<'_>], parent: Option<PartId>, name: &str) -> Option<usize> {
    flat.iter()
        .position(|fp| fp.parent == parent && fp.template.name == name)
}

fn instantiate_compartments(
    network: &mut Network<'_>,
    evaluator: &dyn Evaluator,
    id: PartId,
    counter: &mut SerialCounter,
) -> Result<()> {
    let path = network.part(id).path.clone();
    let count = population(network, evaluator, id)?;
    network.parts[id.0].population = Some(count);

    for index in 0..count {
        let position = {
            let scope = Scope::for_index(network, evaluator, id, index);
            position(&scope, &path)?
        };
        let serial = counter.next_serial();
        network.push_instance(PartInstance {
            serial,
            part: id,
            index,
            kind: InstanceKind::Compartment { position },
        });
    }

    info!("Part {}: {} compartments", path, count);
    Ok(())
}

fn population(network: &Network<'_>, evaluator: &dyn Evaluator, id: PartId) -> Result<usize> {
    let part = network.part(id);
    if part.template.variable(POPULATION).is_none() {
        return Ok(1);
    }
    let scope = Scope::for_part(network, evaluator, id, Phase::Update);
    let value = scope
        .evaluate_variable(POPULATION)
        .map_err(|e| CompilerError::network_generation(&part.path, format!("cannot evaluate $n: {}", e)))?;
    match value {
        Value::Scalar(n) if n.is_finite() && n >= 0.0 => Ok(n.floor() as usize),
        Value::Scalar(n) => Err(CompilerError::network_generation(
            &part.path,
            format!("population must be a non-negative number, got {}", n),
        )),
        other => Err(CompilerError::network_generation(
            &part.path,
            format!("population must be a number, got {:?}", other),
        )),
    }
}

fn position(scope: &Scope<'_, '_>, path: &str) -> Result<[f64; 3]> {
    if scope.template().variable(POSITION).is_none() {
        return Ok([0.0; 3]);
    }
    let value = scope
        .evaluate_variable(POSITION)
        .map_err(|e| CompilerError::network_generation(path, format!("cannot evaluate $xyz: {}", e)))?;
    match value {
        Value::Array(v) if (1..=3).contains(&v.len()) => {
            let mut xyz = [0.0; 3];
            xyz[..v.len()].copy_from_slice(&v);
            Ok(xyz)
        }
        other => Err(CompilerError::network_generation(
            path,
            format!("position must be a vector of 1 to 3 numbers, got {:?}", other),
        )),
    }
}

enum Probability {
    Fixed(f64),
    PerPair,
}

fn instantiate_connections<R: Rng + ?Sized>(
    network: &mut Network<'_>,
    evaluator: &dyn Evaluator,
    id: PartId,
    rng: &mut R,
    counter: &mut SerialCounter,
) -> Result<()> {
    let (path, [pre_part, post_part], aliases) = match &network.part(id).kind {
        PartKind::Connection { aliases, endpoints } => {
            (network.part(id).path.clone(), *endpoints, aliases.clone())
        }
        PartKind::Compartment => return Ok(()),
    };

    let probability = if network.part(id).template.variable(PROBABILITY).is_none() {
        Probability::Fixed(1.0)
    } else if depends_on_endpoints(network.part(id).template, &aliases) {
        Probability::PerPair
    } else {
        let scope = Scope::for_part(network, evaluator, id, Phase::Update);
        Probability::Fixed(scalar_probability(scope.evaluate_variable(PROBABILITY), &path)?)
    };
    if let Probability::Fixed(p) = probability {
        debug!("Part {}: fixed connection probability {}", path, p);
    }

    let pre_serials = network.part(pre_part).instances.clone();
    let post_serials = network.part(post_part).instances.clone();
    let mut adjacency = Adjacency::new(pre_serials.clone(), post_serials.clone());
    let mut index = 0usize;

    for post in &post_serials {
        let mut candidates = pre_serials.clone();
        candidates.shuffle(rng);
        for pre in candidates {
            let p = match probability {
                Probability::Fixed(p) => p,
                Probability::PerPair => {
                    let scope = Scope::for_pair(network, evaluator, id, index, pre, *post);
                    scalar_probability(scope.evaluate_variable(PROBABILITY), &path)?
                }
            };
            if rng.gen::<f64>() < p {
                let serial = counter.next_serial();
                network.push_instance(PartInstance {
                    serial,
                    part: id,
                    index,
                    kind: InstanceKind::Connection { pre, post: *post },
                });
                adjacency.record(pre, *post, serial);
                index += 1;
            }
        }
    }

    info!(
        "Part {}: {} connections over {}x{} candidate pairs",
        path,
        index,
        pre_serials.len(),
        post_serials.len()
    );
    let part = &mut network.parts[id.0];
    part.population = Some(index);
    part.adjacency = Some(adjacency);
    Ok(())
}

fn scalar_probability(value: xynet_ir::eval::Result<Value>, path: &str) -> Result<f64> {
    match value {
        Ok(Value::Scalar(p)) if !p.is_nan() => Ok(p),
        Ok(other) => Err(CompilerError::network_generation(
            path,
            format!("connection probability must be a number, got {:?}", other),
        )),
        Err(e) => Err(CompilerError::network_generation(
            path,
            format!("cannot evaluate $p: {}", e),
        )),
    }
}

// True if `$p` (or anything it references locally) mentions an endpoint alias
// or carries a guard.
fn depends_on_endpoints(template: &EquationSet, aliases: &[String; 2]) -> bool {
    let mut visited = BTreeSet::new();
    let mut pending = vec![PROBABILITY.to_string()];
    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let Some(var) = template.variable(&name) else {
            continue;
        };
        for eq in &var.equations {
            if eq.condition.is_some() {
                return true;
            }
            for referenced in eq.expression.variables() {
                let is_endpoint = referenced
                    .split_once('.')
                    .map(|(prefix, _)| aliases.iter().any(|a| a == prefix))
                    .unwrap_or(false);
                if is_endpoint {
                    return true;
                }
                pending.push(referenced);
            }
        }
    }
    false
}
