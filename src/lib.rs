//! Screenlink - record your screen and share it as a link.
//!
//! This is the main library crate. It provides the capture, compose, encode
//! and upload pipeline used by the `screenlinkd` coordinator, the `screenlink`
//! command line front-end and the `screenlink-server` upload orchestrator.

pub mod audio;
pub mod capture;
pub mod commands;
pub mod compositor;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod recorder;
pub mod server;
pub mod upload;
pub mod utils;
