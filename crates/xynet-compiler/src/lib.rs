#![doc = "xynet compiler - expands part templates into a numbered network and writes a Xyce-style netlist.\n\nPipeline:\n- Instantiation (network): flatten the template tree, allocate compartment instances, then realize connections with a seeded RNG\n- Classification (symbols): choose a translation strategy per equation, memoized in a SymbolTable\n- Device mapping (device): bind tagged equations to native simulator primitives from a static registry (list_devices)\n- Serialization (netlist, render): render the whole artifact in memory and hand it to the sink only on success\n\nEntry points:\n- generate / generate_with: full compile to any `std::io::Write` sink\n- verify_template: structural checks without instantiation\n\nIntegration points:\n- xynet-ir: template graph, expressions and the Evaluator seam\n- xynet-cli: compile / verify / devices commands\n"]
#![deny(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xynet_ir::{BasicEvaluator, EquationSet, Evaluator};

/// Device registry and per-part bindings
pub mod device;
/// Error types
pub mod error;
/// Netlist serializer
pub mod netlist;
/// Instantiation of templates into numbered instances
pub mod network;
/// Names, references and definition lines
pub mod render;
/// Evaluation scopes and equation selection
pub mod scope;
/// Equation classification and the symbol table
pub mod symbols;

pub use device::{find_device, list_devices, DeviceMapping, DeviceParam, DeviceSpec};
pub use error::{CompilerError, Result};
pub use netlist::{write_netlist, NetlistOptions};
pub use network::{instantiate, Adjacency, Network, PartId, PartInstance, PartSet, Serial, SerialCounter};
pub use symbols::{EquationKey, Environment, SymbolDef, SymbolKind, SymbolTable};

/// Run-level settings for [`generate_with`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Title of the netlist; defaults to the root template name
    pub name: Option<String>,
    /// RNG seed; 0 draws a fresh one
    pub seed: u64,
    /// Output expressions `<part-or-alias>.<variable>[<index>]`
    pub outputs: Vec<String>,
}

impl GenerateOptions {
    /// Default options: fresh seed, no outputs
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the netlist title
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the output expressions
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }
}

/// What a successful compile reports besides the netlist text
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOutput {
    /// Seed actually used (never 0)
    pub seed: u64,
    /// Serials per part path
    pub serials: BTreeMap<String, Vec<u64>>,
    /// Adjacency per connection part path
    pub adjacency: BTreeMap<String, Adjacency>,
}

/// Compile `template` with the bundled evaluator and write the netlist to `sink`
pub fn generate<W: Write + ?Sized>(template: &EquationSet, seed: u64, sink: &mut W) -> Result<CompileOutput> {
    generate_with(template, &GenerateOptions::new().with_seed(seed), &BasicEvaluator, sink)
}

/// Compile `template` and write the netlist to `sink`. Nothing is written
/// unless every stage succeeds.
pub fn generate_with<W: Write + ?Sized>(
    template: &EquationSet,
    options: &GenerateOptions,
    evaluator: &dyn Evaluator,
    sink: &mut W,
) -> Result<CompileOutput> {
    verify_template(template)?;

    let seed = if options.seed == 0 {
        let fresh = rand::thread_rng().gen_range(1..=u64::MAX);
        info!("Seed 0 requested, using fresh seed {}", fresh);
        fresh
    } else {
        options.seed
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut counter = SerialCounter::new();
    let network = instantiate(template, evaluator, &mut rng, &mut counter)?;
    let devices = DeviceMapping::build_all(&network)?;

    let env = Environment {
        network: &network,
        evaluator,
        devices: &devices,
    };
    let name = options.name.as_deref().unwrap_or(&template.name);
    let text = write_netlist(
        env,
        &NetlistOptions {
            name,
            seed,
            outputs: &options.outputs,
        },
    )?;

    sink.write_all(text.as_bytes())?;
    sink.flush()?;

    Ok(CompileOutput {
        seed,
        serials: network.serials(),
        adjacency: network.adjacency(),
    })
}

/// Structural checks that need no instantiation: unique sibling names,
/// unique variable names, two bindings per connection, derivative order.
pub fn verify_template(template: &EquationSet) -> Result<()> {
    verify_part(template, &template.name)
}

fn verify_part(part: &EquationSet, path: &str) -> Result<()> {
    if part.name.is_empty() {
        return Err(CompilerError::network_generation(path, "part has an empty name"));
    }

    let mut names = BTreeSet::new();
    for var in &part.variables {
        if !names.insert(var.name.as_str()) {
            return Err(CompilerError::translation(
                format!("{}.{}", path, var.name),
                "variable is declared more than once",
            ));
        }
        if var.order > 1 {
            return Err(CompilerError::translation(
                format!("{}.{}", path, var.name),
                format!("derivative order {} is not supported", var.order),
            ));
        }
        if var.equations.is_empty() {
            warn!("{}.{} has no equations", path, var.name);
        }
    }

    if part.is_connection() && part.connection_bindings.len() != 2 {
        return Err(CompilerError::network_generation(
            path,
            format!(
                "a connection needs exactly 2 bindings, found {}",
                part.connection_bindings.len()
            ),
        ));
    }

    let mut children = BTreeSet::new();
    for child in &part.parts {
        let child_path = format!("{}.{}", path, child.name);
        if !children.insert(child.name.as_str()) {
            return Err(CompilerError::network_generation(child_path, "duplicate part name"));
        }
        verify_part(child, &child_path)?;
    }
    Ok(())
}
