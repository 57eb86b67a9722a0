//! # corso-core
//!
//! Core abstractions for the Corso course-generation platform.
//!
//! This crate provides the foundational types used across all Corso components:
//!
//! - **Organization Context**: Multi-tenant isolation primitives
//! - **Identifiers**: Strongly-typed IDs for courses, outbox entries, and events
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging bootstrap and span helpers
//!
//! ## Crate Boundary
//!
//! `corso-core` is the **only** crate allowed to define shared primitives.
//! Domain crates (`corso-flow` and friends) build on these contracts rather
//! than redefining them.
//!
//! ## Example
//!
//! ```rust
//! use corso_core::prelude::*;
//!
//! // Create an organization scope
//! let org = OrganizationId::new("acme-academy").unwrap();
//!
//! // Generate a unique course ID
//! let course_id = CourseId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod org;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use corso_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CourseId, EventId, OutboxEntryId};
    pub use crate::org::OrganizationId;
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CourseId, EventId, OutboxEntryId};
pub use observability::{LogFormat, init_logging};
pub use org::OrganizationId;
