//! Image edit job queue
//!
//! This library provides the orchestration core of a single-node image-editing
//! service: a durable FIFO job store, a CSV inbox watcher, a permit-bounded
//! worker pool around an opaque image editor, and the HTTP surface in front
//! of them.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
