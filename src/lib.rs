//! Classifies PostgreSQL indexes into health categories (unused, invalid, duplicate,
//! bloated, inefficient) and derives the statement that would remediate each finding.
//!
//! Remediation statements are advisory text; nothing in this crate executes them.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod models;
pub mod reporter;
