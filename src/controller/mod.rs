pub mod analytics;
pub mod catalog;
pub mod clock;
pub mod drivers;
pub mod experiment;
pub mod recorder;

pub use experiment::{reconcile, Context, ReconcileError};
