//! Serial numbering properties over randomly shaped templates

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use xynet_compiler::{instantiate, SerialCounter};
use xynet_ir::{BasicEvaluator, EquationSet, Expr, Variable, POPULATION, PROBABILITY};

fn template(populations: &[u8], probability: f64) -> EquationSet {
    let mut root = EquationSet::new("model");
    for (i, n) in populations.iter().enumerate() {
        root = root.with_part(
            EquationSet::new(format!("p{}", i))
                .with_variable(Variable::equation(POPULATION, Expr::num(f64::from(*n)))),
        );
    }
    for i in 1..populations.len() {
        root = root.with_part(
            EquationSet::new(format!("c{}", i))
                .with_binding("A", format!("p{}", i - 1))
                .with_binding("B", format!("p{}", i))
                .with_variable(Variable::equation(PROBABILITY, Expr::num(probability))),
        );
    }
    root
}

proptest! {
    #[test]
    fn serials_are_unique_and_increasing(
        populations in prop::collection::vec(0u8..12, 1..5),
        probability in 0.0f64..=1.0,
        seed in any::<u64>(),
        first in 1u64..1000,
    ) {
        let t = template(&populations, probability);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counter = SerialCounter::starting_at(first);
        let network = instantiate(&t, &BasicEvaluator, &mut rng, &mut counter).unwrap();

        let serials: Vec<u64> = network.instances().iter().map(|i| i.serial.raw()).collect();
        for pair in serials.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        prop_assert_eq!(serials.first().copied(), Some(first));
        prop_assert_eq!(counter.peek().raw(), first + serials.len() as u64);

        for part in &network.parts {
            for serial in &part.instances {
                let instance = network.instance(*serial).unwrap();
                prop_assert_eq!(instance.part, part.id);
            }
        }

        // Connections are numbered after every compartment.
        let last_compartment = network
            .instances()
            .iter()
            .filter(|i| i.endpoints().is_none())
            .map(|i| i.serial)
            .max();
        for i in network.instances().iter().filter(|i| i.endpoints().is_some()) {
            prop_assert!(Some(i.serial) > last_compartment);
        }
    }
}
