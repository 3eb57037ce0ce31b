//! Parley conversation and authorization server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod accounts;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod patch;
pub mod rbac;
pub mod routes;
pub mod scopes;
pub mod state;
