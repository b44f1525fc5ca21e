//! Core runtime infrastructure.
//!
//! This module contains the essential components for running a member:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Member runtime orchestration
//! - [`error`] - Error types and classification

pub mod config;
pub mod error;
pub mod runtime;
