// User accounts

//! Platform users. The login name doubles as the lookup key: at most one user
//! may exist per name, and the authentication token of every request is
//! simply the identifier of a stored user.

use serde::{Deserialize, Serialize};

/// A platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    /// Login name, unique across the user table.
    pub name: String,
    pub display_name: String,
    /// Superusers may create other users.
    pub su: bool,
}
