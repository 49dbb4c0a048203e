pub mod class;
pub mod controlplane;
pub mod dataplane;
pub mod status;
