//! End-to-end compile scenarios

use std::collections::BTreeSet;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use xynet_compiler::device::{DEVICE_KEY, INPUT_TAG, NODE_TAG, PARAM_TAG};
use xynet_compiler::{
    generate, instantiate, DeviceMapping, EquationKey, Environment, SerialCounter, SymbolKind, SymbolTable,
};
use xynet_ir::{BasicEvaluator, EquationEntry, EquationSet, Expr, Variable, POPULATION, PROBABILITY};

fn cells(n: f64) -> EquationSet {
    EquationSet::new("cells")
        .with_variable(Variable::equation(POPULATION, Expr::num(n)))
        .with_variable(Variable::derivative("V", -Expr::var("V")))
}

fn self_connected(p: f64) -> EquationSet {
    EquationSet::new("model").with_part(cells(3.0)).with_part(
        EquationSet::new("syn")
            .with_binding("A", "cells")
            .with_binding("B", "cells")
            .with_variable(Variable::equation(PROBABILITY, Expr::num(p))),
    )
}

#[test]
fn three_by_three_self_connection() {
    let t = self_connected(1.0);
    let mut rng = StdRng::seed_from_u64(9);
    let mut counter = SerialCounter::new();
    let network = instantiate(&t, &BasicEvaluator, &mut rng, &mut counter).unwrap();

    let cells = network.find_part("model.cells").unwrap();
    assert_eq!(cells.instances.len(), 3);
    for serial in &cells.instances {
        assert_eq!(network.instance(*serial).unwrap().position(), Some([0.0, 0.0, 0.0]));
    }
    let last_cell = cells.instances.iter().max().copied().unwrap();

    let syn = network.find_part("model.syn").unwrap();
    assert_eq!(syn.instances.len(), 9);
    let distinct: BTreeSet<_> = syn.instances.iter().collect();
    assert_eq!(distinct.len(), 9);
    assert!(syn.instances.iter().all(|s| *s > last_cell));

    let adjacency = syn.adjacency.as_ref().unwrap();
    assert_eq!(adjacency.len(), 9);
    for pre in &cells.instances {
        for post in &cells.instances {
            assert_eq!(adjacency.get(*pre, *post).len(), 1, "{} -> {}", pre, post);
        }
    }
}

#[test]
fn fixed_seed_is_byte_identical() {
    let t = self_connected(0.5);
    let mut first = Vec::new();
    let mut second = Vec::new();
    let a = generate(&t, 42, &mut first).unwrap();
    let b = generate(&t, 42, &mut second).unwrap();
    assert_eq!(first, second);
    assert_eq!(a, b);
    assert_eq!(a.adjacency["model.syn"].dump(), b.adjacency["model.syn"].dump());
}

#[test]
fn realized_connections_approach_p_times_n() {
    let p = 0.3;
    let t = EquationSet::new("model")
        .with_part(EquationSet::new("pre").with_variable(Variable::equation(POPULATION, Expr::num(20.0))))
        .with_part(EquationSet::new("post").with_variable(Variable::equation(POPULATION, Expr::num(20.0))))
        .with_part(
            EquationSet::new("syn")
                .with_binding("A", "pre")
                .with_binding("B", "post")
                .with_variable(Variable::equation(PROBABILITY, Expr::num(p))),
        );

    let runs = 20;
    let mut total = 0usize;
    for seed in 1..=runs {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counter = SerialCounter::new();
        let network = instantiate(&t, &BasicEvaluator, &mut rng, &mut counter).unwrap();
        total += network.find_part("model.syn").unwrap().instances.len();
    }
    let mean = total as f64 / runs as f64;
    let expected = p * 400.0;
    assert!((mean - expected).abs() < 12.0, "mean {} vs expected {}", mean, expected);
}

#[test]
fn constant_parameter_is_emitted_once_for_many_instances() {
    let t = EquationSet::new("model").with_part(
        EquationSet::new("layer")
            .with_variable(Variable::equation(POPULATION, Expr::num(100.0)))
            .with_variable(Variable::equation("V", Expr::num(5.0)))
            .with_variable(Variable::derivative("U", Expr::var("V") - Expr::var("U"))),
    );
    let mut sink = Vec::new();
    generate(&t, 1, &mut sink).unwrap();
    let text = String::from_utf8(sink).unwrap();

    assert_eq!(text.matches(".param p_model_layer_V=5\n").count(), 1);
    assert_eq!(text.matches("I={p_model_layer_V - V(").count(), 100);
}

#[test]
fn symbol_lookups_are_memoized() {
    let t = EquationSet::new("layer")
        .with_variable(Variable::equation(POPULATION, Expr::num(100.0)))
        .with_variable(Variable::equation("V", Expr::num(5.0)));
    let mut rng = StdRng::seed_from_u64(1);
    let mut counter = SerialCounter::new();
    let network = instantiate(&t, &BasicEvaluator, &mut rng, &mut counter).unwrap();
    let devices = DeviceMapping::build_all(&network).unwrap();
    let env = Environment {
        network: &network,
        evaluator: &BasicEvaluator,
        devices: &devices,
    };

    let key = EquationKey {
        part: network.parts[0].id,
        variable: 1,
        equation: 0,
    };
    let mut table = SymbolTable::new();
    let first = table.resolve(&env, key).unwrap();
    let again = table.resolve(&env, key).unwrap();
    assert!(Rc::ptr_eq(&first, &again));
    assert_eq!(first.kind, SymbolKind::Parameter { value: 5.0 });
    assert!(!first.instance_specific);
    assert_eq!(table.len(), 1);
}

#[test]
fn connection_state_is_an_additive_update() {
    let t = EquationSet::new("model").with_part(cells(3.0)).with_part(
        EquationSet::new("syn")
            .with_binding("A", "cells")
            .with_binding("B", "cells")
            .with_variable(Variable::equation("w", Expr::num(0.1)))
            .with_variable(Variable::derivative("B.V", Expr::var("w") * Expr::var("A.V"))),
    );
    let mut sink = Vec::new();
    let out = generate(&t, 5, &mut sink).unwrap();
    let text = String::from_utf8(sink).unwrap();

    let capacitors: Vec<&str> = text.lines().filter(|l| l.starts_with('C')).collect();
    assert_eq!(capacitors.len(), 3, "each compartment state is defined once");
    for serial in &out.serials["model.cells"] {
        let define = format!("Cn{}_V ", serial);
        assert_eq!(text.matches(&define).count(), 1);
    }

    let updates: Vec<&str> = text.lines().filter(|l| l.starts_with("Bc")).collect();
    assert_eq!(updates.len(), 9);
    assert!(updates.iter().all(|l| l.contains("_B_V 0 n") && l.contains("I={p_model_syn_w * V(n")));
}

#[test]
fn unknown_device_fails_without_output() {
    let t = EquationSet::new("model").with_part(cells(2.0).with_metadata(DEVICE_KEY, "neuron9"));
    let mut sink = Vec::new();
    let err = generate(&t, 1, &mut sink).unwrap_err();
    assert!(err.is_translation());
    assert!(err.to_string().contains("model.cells"));
    assert!(err.to_string().contains("neuron9"));
    assert!(sink.is_empty());
}

#[test]
fn device_parts_emit_one_model_line() {
    let t = EquationSet::new("model").with_part(
        cells(3.0)
            .with_metadata(DEVICE_KEY, "neuron1")
            .with_variable(Variable::new("gm", 0).with_equation(
                EquationEntry::new(Expr::num(0.5)).with_tag("device.param", "GMEM"),
            )),
    );
    let mut sink = Vec::new();
    generate(&t, 1, &mut sink).unwrap();
    let text = String::from_utf8(sink).unwrap();
    assert_eq!(text.matches(".model m_model_cells NEURON level=1 GMEM={p_model_cells_gm}\n").count(), 1);
    assert_eq!(text.lines().filter(|l| l.starts_with("YNEURON ")).count(), 3);
}

fn neurons(name: &str, n: f64, voltage: Option<&str>) -> EquationSet {
    let part = EquationSet::new(name)
        .with_metadata(DEVICE_KEY, "neuron1")
        .with_variable(Variable::equation(POPULATION, Expr::num(n)));
    match voltage {
        Some(v) => part.with_variable(
            Variable::new(v, 0)
                .with_equation(EquationEntry::new(Expr::num(0.0)).with_tag(NODE_TAG, "0"))
                .with_equation(EquationEntry::new(Expr::num(-65.0)).at_init()),
        ),
        None => part,
    }
}

fn compile(t: &EquationSet) -> (String, xynet_compiler::CompileOutput) {
    let mut sink = Vec::new();
    let output = generate(t, 1, &mut sink).unwrap();
    (String::from_utf8(sink).unwrap(), output)
}

#[test]
fn device_node_starts_from_its_initial_condition() {
    let t = EquationSet::new("model").with_part(neurons("cells", 2.0, Some("V")));
    let (text, _) = compile(&t);
    assert!(text.contains(".param ic_model_cells_V_1=-65\n"));
    assert!(text.contains(".ic V(n2_V)={ic_model_cells_V_1}\n"));
    assert!(text.contains(".ic V(n3_V)={ic_model_cells_V_1}\n"));
    assert!(text.contains("YNEURON y2 n2_V 0 m_model_cells\n"));
    // the update equation stays with the device
    assert!(!text.contains("Bn2_V"));
    assert!(!text.contains("p_model_cells_V"));
}

#[test]
fn synapse_terminals_attach_to_endpoint_membranes() {
    let t = EquationSet::new("model")
        .with_part(neurons("pre", 2.0, Some("V")))
        .with_part(neurons("post", 2.0, None))
        .with_part(
            EquationSet::new("syn")
                .with_metadata(DEVICE_KEY, "synapse1")
                .with_binding("A", "pre")
                .with_binding("B", "post")
                .with_variable(Variable::equation(PROBABILITY, Expr::num(1.0)))
                .with_variable(
                    Variable::new("gmax", 0)
                        .with_equation(EquationEntry::new(Expr::num(0.001)).with_tag(PARAM_TAG, "GMAX")),
                ),
        );
    let (text, output) = compile(&t);

    assert_eq!(text.matches(".model m_model_syn SYNAPSE level=1 GMAX={p_model_syn_gmax}\n").count(), 1);
    assert!(text.contains("YNEURON y4 n4_a 0 m_model_post\n"));
    assert_eq!(text.lines().filter(|l| l.starts_with("YSYNAPSE ")).count(), 4);

    let adjacency = &output.adjacency["model.syn"];
    assert_eq!(adjacency.len(), 4);
    for ((pre, post), connections) in adjacency.iter() {
        for conn in connections {
            let line = format!("YSYNAPSE y{} n{}_V n{}_a m_model_syn\n", conn, pre, post);
            assert!(text.contains(&line), "missing {:?}", line);
        }
    }
}

#[test]
fn synapse_needs_a_node_on_plain_endpoints() {
    let t = EquationSet::new("model").with_part(cells(2.0)).with_part(
        EquationSet::new("syn")
            .with_metadata(DEVICE_KEY, "synapse1")
            .with_binding("A", "cells")
            .with_binding("B", "cells")
            .with_variable(Variable::equation(PROBABILITY, Expr::num(1.0))),
    );
    let mut sink = Vec::new();
    let err = generate(&t, 1, &mut sink).unwrap_err();
    assert!(err.is_translation());
    assert!(err.to_string().contains("model.cells"));
    assert!(sink.is_empty());
}

#[test]
fn input_binding_injects_current_into_the_device_node() {
    let t = EquationSet::new("model").with_part(
        neurons("cells", 2.0, Some("V")).with_variable(
            Variable::new("Iin", 0).with_equation(EquationEntry::new(Expr::num(0.5)).with_tag(INPUT_TAG, "0")),
        ),
    );
    let (text, _) = compile(&t);
    assert_eq!(text.matches(".param p_model_cells_Iin=0.5\n").count(), 1);
    assert!(text.contains("Bi2_Iin 0 n2_V I={p_model_cells_Iin}\n"));
    assert!(text.contains("Bi3_Iin 0 n3_V I={p_model_cells_Iin}\n"));
}
