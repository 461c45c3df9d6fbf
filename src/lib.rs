//! A minimal FAT16-style filesystem emulated inside a single container file,
//! driven by an interactive shell.
//!
//! `fat16` is the on-disk engine; `resolve` decides which arguments address
//! the embedded filesystem; `shell` routes commands and renders output.

pub mod fat16;
pub mod logger;
pub mod resolve;
pub mod shell;
