//! Core renderer settings shared by every subsystem

pub mod config;

pub use config::{RendererConfig, ShaderConfig};
