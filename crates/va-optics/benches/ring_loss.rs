use std::f64::consts::PI;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use va_optics::{loss_fraction_in_ring, EfficiencyParameters, Element, Lattice, LinearEngine, Twiss};

fn ring() -> Lattice {
    let cells = 20;
    let angle = 2.0 * PI / (2 * cells) as f64;
    let mut elements = vec![Element::cavity("SRFCav", 3.0e6, 499.654e6)];
    for _ in 0..cells {
        elements.extend([
            Element::quadrupole("QF", 0.2, 2.0),
            Element::drift("D", 0.5),
            Element::dipole("B", 1.0, angle),
            Element::drift("D", 0.5),
            Element::quadrupole("QD", 0.2, -2.0),
            Element::drift("D", 0.5),
            Element::dipole("B", 1.0, angle),
            Element::drift("D", 0.5),
        ]);
    }
    Lattice::new(3.0e9, 864, elements)
}

fn bench_ring_loss(c: &mut Criterion) {
    let ring = ring();
    let params = EfficiencyParameters::new(3.5e-9, 8.7e-4, 0.01, Twiss::with_betas(10.0, 5.0));
    c.bench_function("ring_loss", |b| {
        b.iter(|| {
            let loss = loss_fraction_in_ring(&LinearEngine, &ring, &params).expect("loss");
            black_box(loss);
        });
    });
}

criterion_group!(benches, bench_ring_loss);
criterion_main!(benches);
