//! xynet CLI crate
//!
//! Purpose:
//! - Command-line access to the template-to-netlist compiler.
//!
//! Major commands (see [commands]):
//! - compile: template (JSON/TOML) → netlist, with optional compile metadata
//!   (serials per part, adjacency matrices).
//! - verify: load a template and run the structural checks.
//! - devices: list the device primitive registry.
//!
//! Integration points:
//! - xynet_ir: template graph, loaded through its `serde` feature.
//! - xynet_compiler: generate_with, verify_template, list_devices.
//!
//! The binary (src/main.rs) loads the configuration, wires up logging and
//! calls [`XynetCli::execute`]. The library surface exists so the commands can
//! be driven from tests without spawning a process.

pub mod commands;
pub mod config;
pub mod error;
pub mod template;

pub use commands::XynetCli;
