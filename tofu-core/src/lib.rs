//! Tofu Core
//!
//! Core types shared by the tofu state engine: addresses for resources,
//! resource instances and outputs, diagnostics, configuration values and the
//! per-address evaluation cache used during a planning pass.

pub mod addrs;
pub mod cache;
pub mod diagnostics;
pub mod value;

pub use addrs::{
    AbsResource, AbsResourceInstance, AddrError, InstanceKey, ModuleInstance, ModuleInstanceStep,
    OutputValue, Resource, ResourceMode,
};
pub use cache::EvalCache;
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use value::Value;
