mod graph_levels;
mod pipeline_core;
