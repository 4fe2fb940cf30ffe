// Render-core library: a declarative render graph compiled once and
// realized against the swapchain, a GPU-driven culling engine emitting
// compacted indirect draws, and the per-frame orchestration tying both
// to the presentation loop.

pub mod backend;
pub mod binding;
pub mod config;
pub mod culling;
pub mod error;
pub mod frame;
pub mod graph;
pub mod scene;

pub use config::Config;
pub use error::ConfigError;
