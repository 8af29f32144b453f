// ABOUTME: Library module for postgres-env-sync
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod commands;
pub mod config;
pub mod error;
pub mod jobs;
pub mod migration;
pub mod postgres;
pub mod utils;
