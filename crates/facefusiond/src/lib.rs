//! Library surface of the FaceFusion daemon: configuration, the HTTP router
//! and the subprocess pipeline adapter. The binary in `main.rs` wires these
//! together; integration tests drive the router directly.

pub mod api;
pub mod config;
pub mod pipeline;
