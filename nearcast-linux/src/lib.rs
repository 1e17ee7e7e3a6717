//! Nearcast for Linux: LAN discovery, encrypted peer sessions and the sharing service.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod events;
pub mod orchestrator;
pub mod session;

pub use orchestrator::SharingService;
