//! Incremental dataflow render engine for procedural textures.
//!
//! The authoring side owns the live node graph; this crate is the render
//! worker that mirrors it, batches invalidations, and keeps one cached GPU
//! texture per node output socket. See `engine::RenderEngine` for the
//! message-driven entry point and `scheduler::Scheduler` for the dirty-set
//! batching model.

pub mod blueprint;
pub mod engine;
pub mod graph;
pub mod protocol;
pub mod queue;
pub mod renderer;
pub mod scheduler;
pub mod value;
pub mod ws;
