//! Trace set management for side-channel analysis projects.
//!
//! A project holds an ordered list of trace sets. Enabled sets are mapped into
//! one global trace index so analysis code can ask for "trace n" without
//! knowing which capture it came from.

pub mod core;
pub mod input;
pub mod project;
pub mod settings;

pub use crate::core::{ConfigError, ConfigFile, TraceBatch, TraceSet, TraceSource};
pub use project::{MappingError, ProjectEvent, TraceIndex, TraceManager};
