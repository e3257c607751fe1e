//! Caravel Core
//!
//! Core types for the Caravel deploy control plane.
//!
//! This crate contains:
//! - Domain types: Run, Runner, Trigger and friends
//! - Event payloads: control-plane signals and scheduled-trigger inputs
//! - Runner payloads: the JSON documents dispatched to remote runners

pub mod domain;
pub mod event;
pub mod payload;
