//! Multi-tenant isolation primitives.
//!
//! Every course belongs to exactly one organization, and all pipeline
//! operations are scoped to a single organization:
//! - **Service boundaries**: API requests carry an organization scope
//! - **Audit trail**: FSM events record the owning organization
//! - **Queue routing**: workers never see another organization's payloads
//!
//! # Example
//!
//! ```rust
//! use corso_core::org::OrganizationId;
//!
//! let org = OrganizationId::new("acme-academy").unwrap();
//! assert_eq!(org.as_str(), "acme-academy");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A unique identifier for an organization.
///
/// Organization IDs must be:
/// - Non-empty
/// - Lowercase alphanumeric with hyphens
/// - Between 3 and 63 characters (compatible with DNS/bucket naming)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(String);

impl OrganizationId {
    /// Creates a new organization ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the organization ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Creates an organization ID without validation.
    ///
    /// Intended for IDs that have already been validated (e.g. read back
    /// from storage).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the organization ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates an organization ID string.
    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "organization ID cannot be empty".to_string(),
            });
        }

        if id.len() < 3 {
            return Err(Error::InvalidId {
                message: format!("organization ID '{id}' is too short (minimum 3 characters)"),
            });
        }

        if id.len() > 63 {
            return Err(Error::InvalidId {
                message: format!("organization ID '{id}' is too long (maximum 63 characters)"),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidId {
                message: format!(
                    "organization ID '{id}' contains invalid characters (only lowercase letters, digits, and hyphens allowed)"
                ),
            });
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(Error::InvalidId {
                message: format!("organization ID '{id}' cannot start or end with a hyphen"),
            });
        }

        Ok(())
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for OrganizationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
