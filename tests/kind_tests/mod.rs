//! Integration tests against a live cluster
//!
//! Tests are organized by the story they tell:
//!
//! - `migration_e2e`: A Helm-installed cluster is migrated to CrdbNodes
//!   ordinal by ordinal and keeps serving its data
//!
//! - `certificates`: Self-signed certificates validate, rotate on demand and
//!   validate again
//!
//! - `operator`: The operator installs, becomes available and is removed
//!
//! # Running These Tests
//!
//! ```bash
//! # Everything (~20min)
//! cargo test --test kind -- --ignored --nocapture
//!
//! # Certificate stories only
//! cargo test --test kind certificates -- --ignored --nocapture
//! ```

mod certificates;
mod helpers;
mod migration_e2e;
mod operator;
