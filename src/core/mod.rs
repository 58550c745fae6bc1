//! Core modules for phasegate's control plane.
//!
//! Leaf to root: task cards and the plan manifest, the guard verifier, the
//! dependency resolver, checkpoint and evidence stores, the gate evaluator,
//! and the orchestrator that drives them.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod gate;
pub mod guard;
pub mod journal;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod resolver;
pub mod store;
pub mod taskcard;
pub mod time;
