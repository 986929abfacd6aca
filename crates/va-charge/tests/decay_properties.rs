use std::sync::Arc;

use proptest::prelude::*;
use va_charge::{ChargeLedger, Lifetimes};
use va_core::{Clock, ManualClock};

fn lifetimes_strategy() -> impl Strategy<Value = Lifetimes> {
    (1.0f64..1e5, 1.0f64..1e5, 0.0f64..1e3).prop_map(|(elastic, inelastic, tc)| Lifetimes {
        elastic,
        inelastic,
        quantum: f64::INFINITY,
        touschek_coefficient: tc,
    })
}

proptest! {
    #[test]
    fn charge_never_increases_or_goes_negative(
        charges in prop::collection::vec(0.0f64..1e-8, 1..16),
        lifetimes in lifetimes_strategy(),
        steps in prop::collection::vec(0.0f64..100.0, 1..8),
    ) {
        let clock = ManualClock::starting_at(0.0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let mut ledger = ChargeLedger::new(charges.len(), shared)
            .expect("ledger")
            .with_lifetimes(lifetimes);
        ledger.inject(&charges);

        let mut previous = ledger.current_charges();
        for dt in steps {
            clock.advance(dt);
            let next = ledger.current_charges();
            for (before, after) in previous.iter().zip(&next) {
                prop_assert!(*after >= 0.0);
                prop_assert!(*after <= *before);
            }
            previous = next;
        }
        prop_assert_eq!(ledger.nan_events(), 0);
    }

    #[test]
    fn injection_lands_modulo_bunch_count(
        nr_bunches in 1usize..10,
        delta in prop::collection::vec(0.0f64..1.0, 0..30),
    ) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(0.0));
        let mut ledger = ChargeLedger::new(nr_bunches, clock).expect("ledger");
        ledger.inject(&delta);

        let mut expected = vec![0.0; nr_bunches];
        for (i, dq) in delta.iter().enumerate() {
            expected[i % nr_bunches] += dq;
        }
        let charges = ledger.current_charges();
        for (got, want) in charges.iter().zip(&expected) {
            prop_assert!((got - want).abs() < 1e-12);
        }
    }
}
