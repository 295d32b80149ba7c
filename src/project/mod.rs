pub mod manager;
pub mod mapping;

pub use manager::{
    config_file_name, project_traces_dir, DpaV3Import, PrefixPrompt, ProjectEvent, TraceManager,
    TraceRow, PROJECT_SECTION,
};
pub use mapping::{assign_ranges, MappingError, TraceIndex};
