// src/invocation/mod.rs

//! Turning a pipeline config plus a unit into a concrete command.
//!
//! - [`builder`] resolves descriptor defaults, template values and overrides.
//! - [`spec`] holds the resolved [`InvocationSpec`] and renders its argv.

pub mod builder;
pub mod spec;

pub use builder::{
    check_overrides, parse_override, parse_overrides, resolve_layers, BatchReport, BuildError,
    InvocationBuilder,
};
pub use spec::{fingerprint, render_command, InvocationSpec};
