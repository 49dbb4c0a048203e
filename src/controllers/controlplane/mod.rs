pub mod controller;

pub use controller::{reconcile, run};

pub mod env;
mod reconcilers;
