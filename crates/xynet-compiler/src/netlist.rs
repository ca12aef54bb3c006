//! Netlist serializer: walks the instantiated network part by part and
//! assembles the complete simulator input in memory.
//!
//! Layout of the artifact:
//!
//! ```text
//! * <run name>
//! * seed: <seed>
//! .tran <dt> <duration>
//! .preprocess addresistors nodcpath 1e12
//! * <part>: <n> instances       (per part, compartments first)
//!   initial conditions of every instance
//!   remaining equations, device models and instances
//! .print tran
//! + <output item>               (one line per item)
//! .end
//! ```

use std::collections::BTreeSet;

use log::{debug, info};
use xynet_ir::expr::format_number;

use crate::device::{DeviceMapping, IGNORE_TAG};
use crate::error::{CompilerError, Result};
use crate::network::{PartId, PartKind, PartSet, Serial};
use crate::render::Translator;
use crate::scope::Phase;
use crate::symbols::{EquationKey, Environment};

/// Root metadata key for the transient step
pub const DT_KEY: &str = "dt";
/// Root metadata key for the simulated duration
pub const DURATION_KEY: &str = "duration";
/// Transient step used when the root does not set one
pub const DEFAULT_DT: f64 = 0.0001;
/// Simulated duration used when the root does not set one
pub const DEFAULT_DURATION: f64 = 1.0;

/// Run-level settings of one netlist
#[derive(Debug, Clone)]
pub struct NetlistOptions<'o> {
    /// Title written to the first line
    pub name: &'o str,
    /// Seed the network was generated with
    pub seed: u64,
    /// Output expressions `<part-or-alias>.<variable>[<index>]`
    pub outputs: &'o [String],
}

/// Render the whole netlist for `env.network`
pub fn write_netlist(env: Environment<'_, '_>, options: &NetlistOptions<'_>) -> Result<String> {
    let mut builder = NetlistBuilder {
        translator: Translator::new(env),
        out: String::new(),
        lines: 0,
    };
    builder.header(options)?;

    let network = env.network;
    let order = network
        .parts
        .iter()
        .filter(|p| !p.is_connection())
        .chain(network.parts.iter().filter(|p| p.is_connection()));
    for part in order {
        builder.part(part)?;
    }

    builder.outputs(options.outputs)?;
    builder.line(".end");

    info!(
        "Netlist rendered: {} lines, {} symbols",
        builder.lines,
        builder.translator.symbols().len()
    );
    Ok(builder.out)
}

struct NetlistBuilder<'a, 't> {
    translator: Translator<'a, 't>,
    out: String,
    lines: usize,
}

impl<'a, 't> NetlistBuilder<'a, 't> {
    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
        self.lines += 1;
    }

    fn extend(&mut self, lines: Vec<String>) {
        for l in lines {
            self.line(l);
        }
    }

    fn header(&mut self, options: &NetlistOptions<'_>) -> Result<()> {
        let root = self
            .translator
            .network()
            .parts
            .first()
            .ok_or_else(|| CompilerError::translation(options.name, "network has no parts"))?;
        let dt = run_setting(root, DT_KEY, DEFAULT_DT)?;
        let duration = run_setting(root, DURATION_KEY, DEFAULT_DURATION)?;

        self.line(format!("* {}", options.name));
        self.line(format!("* seed: {}", options.seed));
        self.line(format!(".tran {} {}", format_number(dt), format_number(duration)));
        self.line(".preprocess addresistors nodcpath 1e12");
        Ok(())
    }

    fn part(&mut self, part: &'a PartSet<'t>) -> Result<()> {
        let n = part.instances.len();
        self.line(format!("* {}: {} instance{}", part.path, n, if n == 1 { "" } else { "s" }));
        debug!("Rendering part {} ({} instances)", part.path, n);

        for serial in &part.instances {
            self.instance_block(part, *serial, Phase::Initial)?;
        }
        for serial in &part.instances {
            self.instance_block(part, *serial, Phase::Update)?;
            if let Some(mapping) = self.translator.device(part.id) {
                let lines = self.translator.device_lines(*serial, mapping)?;
                self.extend(lines);
            }
        }
        Ok(())
    }

    fn instance_block(&mut self, part: &'a PartSet<'t>, serial: Serial, phase: Phase) -> Result<()> {
        let instance = self
            .translator
            .network()
            .instance(serial)
            .ok_or_else(|| CompilerError::translation(&part.path, format!("instance {} does not exist", serial)))?;
        let mapping = self.translator.device(part.id);

        for (v, var) in part.template.variables.iter().enumerate() {
            if var.is_reserved() {
                continue;
            }
            // The device implements bound variables; their initial values still apply.
            if phase == Phase::Update && mapping.map_or(false, |m| m.shadows(&var.name)) {
                continue;
            }
            let Some(equation) = self.translator.select(instance, v, phase)? else {
                continue;
            };
            if var.equations[equation].tag(IGNORE_TAG).is_some() {
                continue;
            }
            let lines = self.translator.definition(
                serial,
                EquationKey {
                    part: part.id,
                    variable: v,
                    equation,
                },
            )?;
            self.extend(lines);
        }
        Ok(())
    }

    fn outputs(&mut self, outputs: &[String]) -> Result<()> {
        self.line(".print tran");
        if outputs.is_empty() {
            self.line("+ V(*)");
            return Ok(());
        }
        for expression in outputs {
            let items = self
                .output_items(expression)
                .map_err(|e| CompilerError::translation(expression.as_str(), reason_of(e)))?;
            for item in items {
                self.line(format!("+ {}", item));
            }
        }
        Ok(())
    }

    fn output_items(&mut self, expression: &str) -> Result<Vec<String>> {
        let (target, index) = split_index(expression)?;
        let (part_ref, variable) = target
            .rsplit_once('.')
            .ok_or_else(|| CompilerError::translation(expression, "expected <part>.<variable>"))?;
        let part = self.output_part(part_ref)?;
        let mapping = self.translator.device(part.id);

        let internal = part.template.variable(variable).is_none()
            && mapping.map_or(false, |m| m.spec.has_internal(variable));
        if part.template.variable(variable).is_none() && !internal {
            return Err(CompilerError::translation(
                expression,
                format!("part '{}' has no variable '{}'", part.path, variable),
            ));
        }

        let serials: Vec<Serial> = match index {
            Some(k) => {
                let serial = part.instances.get(k).ok_or_else(|| {
                    CompilerError::translation(
                        expression,
                        format!("index {} is out of range for {} instances", k, part.instances.len()),
                    )
                })?;
                vec![*serial]
            }
            None => part.instances.clone(),
        };

        let mut items = Vec::with_capacity(serials.len());
        for serial in serials {
            if internal {
                items.push(format!("N({}:{})", DeviceMapping::instance_name(serial), variable));
                continue;
            }
            let rendered = self.translator.reference(serial, variable, Phase::Update)?;
            if rendered.starts_with("V(") || rendered.starts_with("N(") {
                items.push(rendered);
            } else {
                items.push(format!("{{{}}}", rendered));
            }
        }
        Ok(items)
    }

    // Full path first, then a unique leaf name, then a connection alias.
    fn output_part(&self, reference: &str) -> Result<&'a PartSet<'t>> {
        let network = self.translator.network();
        if let Some(part) = network.find_part(reference) {
            return Ok(part);
        }

        let leaves: Vec<&PartSet<'t>> = network.parts.iter().filter(|p| p.name() == reference).collect();
        match leaves.len() {
            1 => return Ok(leaves[0]),
            0 => {}
            _ => {
                return Err(CompilerError::translation(
                    reference,
                    format!("part name is ambiguous: {}", paths(&leaves)),
                ))
            }
        }

        let targets: BTreeSet<PartId> = network
            .parts
            .iter()
            .filter_map(|p| match &p.kind {
                PartKind::Connection { aliases, endpoints } => {
                    aliases.iter().position(|a| a == reference).map(|slot| endpoints[slot])
                }
                PartKind::Compartment => None,
            })
            .collect();
        let mut targets = targets.into_iter();
        match (targets.next(), targets.next()) {
            (Some(id), None) => Ok(network.part(id)),
            (Some(_), Some(_)) => Err(CompilerError::translation(
                reference,
                "alias refers to different parts in different connections",
            )),
            (None, _) => Err(CompilerError::translation(reference, "no part or alias with this name")),
        }
    }
}

fn run_setting(root: &PartSet<'_>, key: &str, default: f64) -> Result<f64> {
    let Some(text) = root.template.metadata.get(key) else {
        return Ok(default);
    };
    match text.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(CompilerError::translation(
            &root.path,
            format!("metadata '{}' must be a positive number, got '{}'", key, text),
        )),
    }
}

fn split_index(expression: &str) -> Result<(&str, Option<usize>)> {
    let Some(body) = expression.strip_suffix(']') else {
        return Ok((expression, None));
    };
    let (target, index) = body
        .rsplit_once('[')
        .ok_or_else(|| CompilerError::translation(expression, "unbalanced index brackets"))?;
    let k = index
        .trim()
        .parse::<usize>()
        .map_err(|_| CompilerError::translation(expression, format!("invalid index '{}'", index)))?;
    Ok((target, Some(k)))
}

fn paths(parts: &[&PartSet<'_>]) -> String {
    parts.iter().map(|p| p.path.as_str()).collect::<Vec<_>>().join(", ")
}

fn reason_of(error: CompilerError) -> String {
    match error {
        CompilerError::Translation { reason, .. } | CompilerError::NetworkGeneration { reason, .. } => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DEVICE_KEY, NODE_TAG, VAR_TAG};
    use crate::network::{instantiate, SerialCounter};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use xynet_ir::{BasicEvaluator, EquationEntry, EquationSet, Expr, Variable, POPULATION, PULSE};

    fn render(template: &EquationSet, outputs: &[&str]) -> Result<String> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut counter = SerialCounter::new();
        let network = instantiate(template, &BasicEvaluator, &mut rng, &mut counter)?;
        let devices = DeviceMapping::build_all(&network)?;
        let env = Environment {
            network: &network,
            evaluator: &BasicEvaluator,
            devices: &devices,
        };
        let outputs: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        write_netlist(
            env,
            &NetlistOptions {
                name: &template.name,
                seed: 7,
                outputs: &outputs,
            },
        )
    }

    fn layer() -> EquationSet {
        EquationSet::new("layer")
            .with_variable(Variable::equation(POPULATION, Expr::num(2.0)))
            .with_variable(
                Variable::new("V", 1)
                    .with_equation(EquationEntry::new(
                        -Expr::var("V") / Expr::var("tau") + Expr::var("I"),
                    ))
                    .with_equation(EquationEntry::new(Expr::num(-65.0)).at_init()),
            )
            .with_variable(Variable::equation("tau", Expr::num(0.02)))
            .with_variable(Variable::equation("I", Expr::call(PULSE, vec![Expr::num(0.001)])))
            .with_variable(
                Variable::new("probe", 0).with_equation(EquationEntry::new(Expr::num(1.0)).with_tag(IGNORE_TAG, "")),
            )
    }

    #[test]
    fn complete_netlist_layout() {
        let t = EquationSet::new("model").with_part(layer());
        let text = render(&t, &[]).unwrap();
        let expected = "\
* model
* seed: 7
.tran 0.0001 1
.preprocess addresistors nodcpath 1e12
* model: 1 instance
* model.layer: 2 instances
.param ic_model_layer_V_1=-65
.ic V(n2_V)={ic_model_layer_V_1}
.ic V(n3_V)={ic_model_layer_V_1}
Cn2_V n2_V 0 1
Bn2_V 0 n2_V I={-V(n2_V) / p_model_layer_tau + V(s_model_layer_I)}
.param p_model_layer_tau=0.02
Vs_model_layer_I s_model_layer_I 0 PULSE(0 1 0 0 0 0.001)
Cn3_V n3_V 0 1
Bn3_V 0 n3_V I={-V(n3_V) / p_model_layer_tau + V(s_model_layer_I)}
.print tran
+ V(*)
.end
";
        assert_eq!(text, expected);
    }

    #[test]
    fn run_settings_come_from_root_metadata() {
        let t = EquationSet::new("model")
            .with_metadata(DT_KEY, "1e-5")
            .with_metadata(DURATION_KEY, "0.5")
            .with_part(layer());
        let text = render(&t, &[]).unwrap();
        assert!(text.contains("\n.tran 0.00001 0.5\n"));

        let t = EquationSet::new("model").with_metadata(DT_KEY, "-1");
        let err = render(&t, &[]).unwrap_err();
        assert!(err.is_translation());
        assert!(err.to_string().contains("'dt'"));
    }

    fn outputs_model() -> EquationSet {
        EquationSet::new("model")
            .with_part(layer())
            .with_part(EquationSet::new("a").with_part(EquationSet::new("cells")))
            .with_part(EquationSet::new("b").with_part(EquationSet::new("cells")))
            .with_part(
                EquationSet::new("syn")
                    .with_binding("A", "layer")
                    .with_binding("B", "layer")
                    .with_variable(Variable::equation("$p", Expr::num(0.0))),
            )
    }

    #[test]
    fn outputs_resolve_paths_leaves_and_aliases() {
        let t = outputs_model();
        let text = render(&t, &["layer.V", "model.layer.V[1]", "A.V[0]", "layer.tau[0]"]).unwrap();
        let tail: Vec<&str> = text.lines().skip_while(|l| *l != ".print tran").collect();
        assert_eq!(
            tail,
            vec![
                ".print tran",
                "+ V(n2_V)",
                "+ V(n3_V)",
                "+ V(n3_V)",
                "+ V(n2_V)",
                "+ {p_model_layer_tau}",
                ".end",
            ]
        );
    }

    #[test]
    fn bad_outputs_name_the_expression() {
        let t = outputs_model();
        for (output, reason) in [
            ("layer.V[5]", "out of range"),
            ("layer.nope", "no variable"),
            ("ghost.V", "no part or alias"),
            ("cells.V", "ambiguous"),
            ("layerV", "expected <part>.<variable>"),
            ("layer.V[x]", "invalid index"),
        ] {
            let err = render(&t, &[output]).unwrap_err();
            match err {
                CompilerError::Translation { subject, reason: r } => {
                    assert_eq!(subject, output);
                    assert!(r.contains(reason), "{}: {}", output, r);
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn device_internals_print_as_device_variables() {
        let t = EquationSet::new("cell")
            .with_metadata(DEVICE_KEY, "neuron2")
            .with_variable(
                Variable::new("m", 0).with_equation(EquationEntry::new(Expr::num(0.0)).with_tag(VAR_TAG, "M")),
            );
        let text = render(&t, &["cell.N", "cell.m"]).unwrap();
        assert!(text.contains("\n+ N(y1:N)\n+ N(y1:M)\n"));
        assert!(text.contains(".model m_cell NEURON level=2\n"));
        assert!(text.contains("YNEURON y1 n1_a 0 m_cell\n"));
        // Device-shadowed equations are not emitted.
        assert!(!text.contains("p_cell_m"));
    }

    #[test]
    fn device_nodes_keep_initial_conditions() {
        let t = EquationSet::new("cell").with_metadata(DEVICE_KEY, "neuron1").with_variable(
            Variable::new("V", 0)
                .with_equation(EquationEntry::new(Expr::num(0.0)).with_tag(NODE_TAG, "0"))
                .with_equation(EquationEntry::new(Expr::num(-70.0)).at_init()),
        );
        let text = render(&t, &[]).unwrap();
        let ic = text.find(".ic V(n1_V)={ic_cell_V_1}\n").unwrap();
        let device = text.find("YNEURON y1 n1_V 0 m_cell\n").unwrap();
        assert!(ic < device);
        assert!(text.contains(".param ic_cell_V_1=-70\n"));
    }
}
