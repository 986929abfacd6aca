#![deny(missing_docs)]
#![doc = "Per-bunch charge ledger with elastic, inelastic and Touschek decay."]

pub mod ledger;

pub use ledger::{
    touschek_coefficient_from_reference, ChargeLedger, LedgerSnapshot, LifetimeUpdate, Lifetimes,
};
