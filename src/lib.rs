pub mod cli;
pub mod cluster;
pub mod config;
pub mod fetch;
pub mod gapfill;
pub mod merge;
pub mod normalize;
pub mod probe;
pub mod reconciler;
pub mod record;
pub mod select;
pub mod store;
pub mod trigger;

pub use reconciler::{PassOutcome, PassReport, Reconciler, ReconcilerSettings};
pub use store::{RecordStore, StoreError};
pub use trigger::{TriggerController, TriggerSource};
