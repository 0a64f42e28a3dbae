//! Core library for ActiveTigger — shared domain types, configuration,
//! persistence, password hashing, and the uniform error kind used across
//! every subsystem crate in the workspace.
//!
//! This crate provides:
//! - Closed sum types for projects, schemes, annotations, features, models,
//!   tasks, and users/auth
//! - Configuration loading with environment-variable overrides
//! - Async SQLite-backed persistence for every entity in the data model
//! - Password hashing for the Users/Auth service
//! - The uniform `ErrorKind` every subsystem error converts into
//! - `tracing-subscriber` initialization shared by every binary

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod types;
