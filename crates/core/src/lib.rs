//! Tiled super-resolution engine: tile layout, tensor codec, guarded
//! blending, feathered composition and the post-filter chain.

pub mod backend;
pub mod baseline;
pub mod compositor;
pub mod config;
pub mod drift_guard;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod post_filter;
pub mod region;
pub mod tensor;
pub mod tile;
pub mod types;
