// src/pipeline/mod.rs

//! Pipeline configuration: descriptors, invocation templates and the registry
//! of installed pipeline versions.

pub mod descriptor;
pub mod registry;
pub mod template;

pub use descriptor::{describe_value, Descriptor, ItemType, ParamSpec, ParamType};
pub use registry::{compare_versions, PipelineConfig, PipelineMetadata, PipelineRegistry};
pub use template::{InvocationTemplate, BUILTIN_PLACEHOLDERS};
