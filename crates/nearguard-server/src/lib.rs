//! # nearguard-server
//!
//! HTTP server library for the nearguard beacon proximity tracker.
//!
//! This library provides the API handlers, state management and logging
//! setup used by the `nearguard-server` binary.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
