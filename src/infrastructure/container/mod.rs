//! Container module

pub mod registry;

pub use registry::{Bean, BeanRegistry, RegistryStats};
