pub mod controller;

pub use controller::{reconcile, run};

pub mod defaults;
mod reconcilers;
pub mod validation;
