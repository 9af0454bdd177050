//! `circstore-core`: identifiers and error model shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{RecordId, TenantId, is_word_token};
