//! Fairness Middleware, Tier Router, Identity Resolver, and the Analyze and
//! SpecView job pipelines (spec.md §4.2-§4.4, §4.6, §4.8). This crate wires
//! the `queue`, `storage`, `vcs`, and `ai` crates together; `main.rs` is the
//! only binary entry point and owns configuration loading and process
//! bootstrap (SPEC_FULL.md §0).

pub mod analyze;
pub mod config;
pub mod error;
pub mod fairness;
pub mod identity;
pub mod multi_model_ai;
pub mod oauth;
pub mod parser;
pub mod specview;
pub mod tier_router;
