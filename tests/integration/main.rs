mod config_pipeline;
mod error_handling;
