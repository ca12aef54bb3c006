//! Native device registry and per-part device bindings

use std::collections::BTreeMap;

use log::debug;

use crate::error::{CompilerError, Result};
use crate::network::{Network, PartId, PartSet};

/// Part metadata key selecting a device
pub const DEVICE_KEY: &str = "device";
/// Equation tag binding a variable to a device parameter
pub const PARAM_TAG: &str = "device.param";
/// Equation tag binding a variable to a device node
pub const NODE_TAG: &str = "device.node";
/// Equation tag binding a variable to a device internal variable
pub const VAR_TAG: &str = "device.var";
/// Equation tag injecting a variable as current into a device node
pub const INPUT_TAG: &str = "device.input";
/// Equation tag excluding an equation from the netlist
pub const IGNORE_TAG: &str = "ignore";

/// Device parameter specification
#[derive(Debug, Clone, Copy)]
pub struct DeviceParam {
    /// Parameter name as written in the netlist
    pub name: &'static str,
    /// Short doc string
    pub doc: &'static str,
}

/// Device specification in the registry
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    /// Registry name used in part metadata
    pub name: &'static str,
    /// Instance line keyword
    pub device: &'static str,
    /// Model type on the `.model` line
    pub model: &'static str,
    /// Model level
    pub level: u32,
    /// Maps onto connection parts instead of compartments
    pub connection: bool,
    /// Node placeholders; `{}` is replaced per instance, `0` is ground.
    /// Connection devices attach unbound node `k` to endpoint `k`.
    pub nodes: &'static [&'static str],
    /// Accepted parameters
    pub params: &'static [DeviceParam],
    /// Inspectable internal variables
    pub internals: &'static [&'static str],
    /// Short description
    pub doc: &'static str,
}

impl DeviceSpec {
    /// Parameter lookup
    pub fn param(&self, name: &str) -> Option<&DeviceParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// True if `name` is an internal variable
    pub fn has_internal(&self, name: &str) -> bool {
        self.internals.iter().any(|i| *i == name)
    }

    /// First non-ground node
    pub fn membrane_node(&self) -> Option<usize> {
        self.nodes.iter().position(|n| *n != "0")
    }
}

static DEVICES: &[DeviceSpec] = &[
    DeviceSpec {
        name: "neuron1",
        device: "YNEURON",
        model: "NEURON",
        level: 1,
        connection: false,
        nodes: &["{}_a", "0"],
        params: &[
            DeviceParam { name: "CMEM", doc: "Membrane capacitance" },
            DeviceParam { name: "GMEM", doc: "Membrane conductance" },
            DeviceParam { name: "VREST", doc: "Resting potential" },
        ],
        internals: &[],
        doc: "Passive membrane",
    },
    DeviceSpec {
        name: "neuron2",
        device: "YNEURON",
        model: "NEURON",
        level: 2,
        connection: false,
        nodes: &["{}_a", "0"],
        params: &[
            DeviceParam { name: "CMEM", doc: "Membrane capacitance" },
            DeviceParam { name: "GMEM", doc: "Leak conductance" },
            DeviceParam { name: "VREST", doc: "Leak reversal potential" },
            DeviceParam { name: "EK", doc: "Potassium reversal potential" },
            DeviceParam { name: "GK", doc: "Potassium conductance" },
            DeviceParam { name: "ENA", doc: "Sodium reversal potential" },
            DeviceParam { name: "GNA", doc: "Sodium conductance" },
        ],
        internals: &["N", "M", "H"],
        doc: "Hodgkin-Huxley membrane",
    },
    DeviceSpec {
        name: "synapse1",
        device: "YSYNAPSE",
        model: "SYNAPSE",
        level: 1,
        connection: true,
        nodes: &["{}_pre", "{}_post"],
        params: &[
            DeviceParam { name: "GMAX", doc: "Maximal conductance" },
            DeviceParam { name: "EREV", doc: "Reversal potential" },
            DeviceParam { name: "TAU1", doc: "Rise time constant" },
            DeviceParam { name: "TAU2", doc: "Decay time constant" },
        ],
        internals: &["R"],
        doc: "Dual-exponential conductance synapse",
    },
];

/// List device specifications for CLI introspection
pub fn list_devices() -> &'static [DeviceSpec] {
    DEVICES
}

/// Registry lookup by name
pub fn find_device(name: &str) -> Option<&'static DeviceSpec> {
    DEVICES.iter().find(|d| d.name == name)
}

/// Device bindings of one part, built once and shared by all its instances
#[derive(Debug, Clone)]
pub struct DeviceMapping {
    /// Chosen device
    pub spec: &'static DeviceSpec,
    /// Node index -> variable
    pub nodes: BTreeMap<usize, String>,
    /// Device parameter -> variable
    pub params: BTreeMap<String, String>,
    /// Device internal -> variable
    pub internals: BTreeMap<String, String>,
    /// Variable -> node index receiving its current
    pub inputs: BTreeMap<String, usize>,
}

impl DeviceMapping {
    /// Scan a part's metadata and equation tags. `Ok(None)` if the part has no device.
    pub fn build(part: &PartSet<'_>) -> Result<Option<Self>> {
        let Some(name) = part.template.metadata.get(DEVICE_KEY) else {
            return Ok(None);
        };
        let spec = find_device(name)
            .ok_or_else(|| CompilerError::translation(&part.path, format!("unknown device '{}'", name)))?;
        if spec.connection != part.is_connection() {
            let expected = if spec.connection { "connection" } else { "compartment" };
            return Err(CompilerError::translation(
                &part.path,
                format!("device '{}' requires a {} part", spec.name, expected),
            ));
        }

        let mut mapping = Self {
            spec,
            nodes: BTreeMap::new(),
            params: BTreeMap::new(),
            internals: BTreeMap::new(),
            inputs: BTreeMap::new(),
        };

        for var in &part.template.variables {
            let subject = format!("{}.{}", part.path, var.name);
            for eq in &var.equations {
                for (key, value) in &eq.metadata {
                    match key.as_str() {
                        PARAM_TAG => {
                            if spec.param(value).is_none() {
                                return Err(CompilerError::translation(
                                    &subject,
                                    format!("device '{}' has no parameter '{}'", spec.name, value),
                                ));
                            }
                            bind(&mut mapping.params, value.clone(), &var.name, &subject)?;
                        }
                        NODE_TAG => {
                            let k = node_index(spec, value, &subject)?;
                            bind(&mut mapping.nodes, k, &var.name, &subject)?;
                        }
                        VAR_TAG => {
                            if !spec.has_internal(value) {
                                return Err(CompilerError::translation(
                                    &subject,
                                    format!("device '{}' has no internal variable '{}'", spec.name, value),
                                ));
                            }
                            bind(&mut mapping.internals, value.clone(), &var.name, &subject)?;
                        }
                        INPUT_TAG => {
                            let k = node_index(spec, value, &subject)?;
                            mapping.inputs.insert(var.name.clone(), k);
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!(
            "Part {}: device {} with {} node, {} parameter, {} internal, {} input bindings",
            part.path,
            spec.name,
            mapping.nodes.len(),
            mapping.params.len(),
            mapping.internals.len(),
            mapping.inputs.len()
        );
        Ok(Some(mapping))
    }

    /// Build the mappings of every device-tagged part
    pub fn build_all(network: &Network<'_>) -> Result<BTreeMap<PartId, DeviceMapping>> {
        let mut out = BTreeMap::new();
        for part in &network.parts {
            if let Some(m) = Self::build(part)? {
                out.insert(part.id, m);
            }
        }
        Ok(out)
    }

    /// Node index a variable is bound to
    pub fn node_of(&self, variable: &str) -> Option<usize> {
        self.nodes.iter().find(|(_, v)| *v == variable).map(|(k, _)| *k)
    }

    /// Internal variable a variable is bound to
    pub fn internal_of(&self, variable: &str) -> Option<&str> {
        self.internals
            .iter()
            .find(|(_, v)| *v == variable)
            .map(|(k, _)| k.as_str())
    }

    /// Node- and internal-bound variables are implemented by the device
    pub fn shadows(&self, variable: &str) -> bool {
        self.node_of(variable).is_some() || self.internal_of(variable).is_some()
    }

    /// Instance name on the device line
    pub fn instance_name(serial: impl std::fmt::Display) -> String {
        format!("y{}", serial)
    }

    /// Shared model name of a part
    pub fn model_name(part: &PartSet<'_>) -> String {
        format!("m_{}", crate::render::sanitize(&part.path))
    }
}

fn bind<K: Ord>(map: &mut BTreeMap<K, String>, key: K, variable: &str, subject: &str) -> Result<()> {
    if let Some(existing) = map.get(&key) {
        if existing != variable {
            return Err(CompilerError::translation(
                subject,
                format!("device binding already taken by '{}'", existing),
            ));
        }
    }
    map.insert(key, variable.to_string());
    Ok(())
}

fn node_index(spec: &DeviceSpec, value: &str, subject: &str) -> Result<usize> {
    let k: usize = value.trim().parse().map_err(|_| {
        CompilerError::translation(subject, format!("node index '{}' is not a number", value))
    })?;
    match spec.nodes.get(k) {
        None => Err(CompilerError::translation(
            subject,
            format!("device '{}' has {} nodes, index {} is out of range", spec.name, spec.nodes.len(), k),
        )),
        Some(&"0") => Err(CompilerError::translation(
            subject,
            format!("node {} of device '{}' is ground", k, spec.name),
        )),
        Some(_) => Ok(k),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{instantiate, SerialCounter};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use xynet_ir::{BasicEvaluator, EquationEntry, EquationSet, Expr, Variable};

    fn mapping_for(template: &EquationSet) -> Result<Option<DeviceMapping>> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut counter = SerialCounter::new();
        let net = instantiate(template, &BasicEvaluator, &mut rng, &mut counter)?;
        DeviceMapping::build(&net.parts[0])
    }

    fn tagged(name: &str, expr: Expr, key: &str, value: &str) -> Variable {
        Variable::new(name, 0).with_equation(EquationEntry::new(expr).with_tag(key, value))
    }

    #[test]
    fn registry_is_introspectable() {
        let names: Vec<_> = list_devices().iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["neuron1", "neuron2", "synapse1"]);
        let hh = find_device("neuron2").unwrap();
        assert!(hh.param("GNA").is_some());
        assert!(hh.has_internal("M"));
        assert!(find_device("synapse1").unwrap().connection);
        assert_eq!(hh.membrane_node(), Some(0));
    }

    #[test]
    fn bindings_are_collected() {
        let t = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron2")
            .with_variable(tagged("C", Expr::num(1.0), PARAM_TAG, "CMEM"))
            .with_variable(tagged("V", Expr::num(0.0), NODE_TAG, "0"))
            .with_variable(tagged("n", Expr::num(0.0), VAR_TAG, "N"))
            .with_variable(tagged("I", Expr::num(0.5), INPUT_TAG, "0"));
        let m = mapping_for(&t).unwrap().unwrap();
        assert_eq!(m.params.get("CMEM").map(String::as_str), Some("C"));
        assert_eq!(m.node_of("V"), Some(0));
        assert_eq!(m.internal_of("n"), Some("N"));
        assert_eq!(m.inputs.get("I"), Some(&0));
        assert!(m.shadows("V") && m.shadows("n") && !m.shadows("C"));
    }

    #[test]
    fn untagged_part_has_no_mapping() {
        let t = EquationSet::new("cell");
        assert!(mapping_for(&t).unwrap().is_none());
    }

    #[test]
    fn unknown_device_names_the_part() {
        let t = EquationSet::new("cell").with_metadata(DEVICE_KEY, "transistor9");
        let err = mapping_for(&t).unwrap_err();
        assert!(err.is_translation());
        assert!(err.to_string().contains("cell"));
        assert!(err.to_string().contains("transistor9"));
    }

    #[test]
    fn invalid_bindings_name_the_variable() {
        let bad_param = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron1")
            .with_variable(tagged("X", Expr::num(1.0), PARAM_TAG, "GNA"));
        let err = mapping_for(&bad_param).unwrap_err();
        assert!(err.to_string().contains("cell.X"));

        let bad_node = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron1")
            .with_variable(tagged("V", Expr::num(0.0), NODE_TAG, "5"));
        assert!(mapping_for(&bad_node).unwrap_err().to_string().contains("out of range"));

        let ground = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron1")
            .with_variable(tagged("V", Expr::num(0.0), NODE_TAG, "1"));
        assert!(mapping_for(&ground).unwrap_err().to_string().contains("ground"));

        let bad_internal = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron1")
            .with_variable(tagged("n", Expr::num(0.0), VAR_TAG, "N"));
        assert!(mapping_for(&bad_internal).unwrap_err().is_translation());
    }

    #[test]
    fn synapse_requires_connection_part() {
        let t = EquationSet::new("cell").with_metadata(DEVICE_KEY, "synapse1");
        assert!(mapping_for(&t).unwrap_err().to_string().contains("connection part"));
    }
}
