//! Devicelink - OAuth 2.0 Device Authorization Grant (RFC 8628)
//!
//! This library provides the core functionality for the devicelink server.
//! It exposes all modules for testing purposes.

pub mod clock;
pub mod codes;
pub mod entities;
pub mod errors;
pub mod identity;
pub mod jobs;
pub mod service;
pub mod settings;
pub mod store;
pub mod web;
