pub mod config;
pub mod source;
pub mod trace_set;

pub use config::{ConfigError, ConfigFile};
pub use source::{TraceBatch, TraceSource};
pub use trace_set::{MappedRange, TraceSet, TRACE_SECTION};
