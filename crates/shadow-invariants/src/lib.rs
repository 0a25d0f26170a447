//! Shadow Engine Invariant Checker
//!
//! Bright-line safety rules evaluated against a shadow execution trace. A
//! single failed rule forces rejection of the proposal; no downstream
//! judgment can override it.
//!
//! # Rules
//!
//! - `egress_allowlist`: network targets must be allowlisted hosts or subdomains
//! - `budget_limit`: cumulative spend must stay under the configured limit
//! - `disallowed_operation`: operations must not match a disallowed pattern
//! - `disallowed_output`: responses must not match a disallowed pattern
//! - `mandate_signature`: the signed mandate must cover the evaluated diff

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod checker;
mod error;
pub mod mandate;
pub mod rules;

pub use checker::InvariantChecker;
pub use error::InvariantConfigError;
pub use mandate::{parse_verifying_key, sign_mandate, verify_mandate};
pub use rules::{InvariantRules, Rule, RuleFailure};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
