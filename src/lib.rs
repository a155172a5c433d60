//! # playbook-runner
//!
//! Deferred playbook scheduler layered on a case-management REST API.
//!
//! A delay request is stored on the platform as a pending marker with an
//! expiration rule. Each poll cycle scans the pending markers, runs the
//! expired ones, and keeps the owning case's `waiting` tag in step with
//! what is still pending.

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod playbook;
pub mod repository;
pub mod rest;
pub mod telemetry;
