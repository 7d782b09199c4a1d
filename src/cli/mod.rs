//! CLI module for atelier
//!
//! Handles command-line argument parsing.

pub mod args;

pub use args::{Args, Commands};
