//! IaC Catalog Scanner: turns the on-disk compose tree into the
//! `iac_stacks`/`iac_services`/`iac_files` rows the Drift Engine and
//! Deployment Orchestrator read.

pub mod compose_model;
pub mod scanner;
