#![deny(missing_docs)]
#![doc = "Optics engine collaborator, a built-in linear engine and the charge-loss efficiency model."]

pub mod efficiency;
pub mod engine;
pub mod lattice;
pub mod lifetime;
pub mod linear;
pub mod twiss;

pub use efficiency::{
    loss_fraction_in_line, loss_fraction_in_ring, transform_to_local_coordinates,
    CoordinateOffset, EfficiencyParameters, LineLoss,
};
pub use engine::{
    EquilibriumSummary, LatticeLifetimes, LifetimeInputs, LinearOptics, OpticsEngine,
    TwissBoundary,
};
pub use lattice::{Apertures, Element, ElementKind, Lattice, LatticeLayout};
pub use linear::LinearEngine;
pub use twiss::{PhaseSpace, Twiss, TwissTable};
