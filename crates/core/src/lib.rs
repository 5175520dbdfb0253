//! Core crate for the vidgen text-to-video service.

pub mod backend;
pub mod config;
pub mod enhance;
pub mod export;
pub mod generator;
pub mod housekeeping;
pub mod logging;
pub mod progress;
pub mod runtime;
pub mod server;
pub mod service;
pub mod tiling;
pub mod upscale;
