pub mod config;
pub mod gateway;
pub mod sandbox;
pub mod security;
pub mod workflow;

pub use config::Config;
pub use gateway::*;
pub use sandbox::{
    all_paths_in_sandbox, check_output_size, classify_script, execute, extract_paths, validate_syntax, SandboxRoot,
};
