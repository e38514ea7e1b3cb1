//! Portrait verification service.
//!
//! Admits portrait-verification jobs, runs them on a bounded worker pool with
//! resource-aware back-pressure, and drives each through an iterative
//! detect / analyse / validate / enhance loop until the image converges on
//! the target format's requirements or the iteration budget runs out.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
