// User registry

//! Login resolves a login name to the user's identifier, which then serves as
//! the authentication token of every subsequent request. Only superusers may
//! create users, and a login name may exist at most once.

use crate::models::{parse_descriptor, Referer, User};
use crate::store::{EntityStore, TableKind};
use crate::{FlowError, Result};

/// Resolve a login name to the user identifier (latest version).
pub fn login(store: &EntityStore, name: &str) -> Result<String> {
    store.resolve(TableKind::User, &Referer::latest(name))
}

/// Register a new user. The calling user must be a superuser; duplicate login
/// names are rejected.
pub fn add_user(
    store: &EntityStore,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let creating_user = store.get_user(logged_in_user)?;
    if !creating_user.entity.su {
        return Err(FlowError::MustBeSuperuser);
    }
    let user: User = parse_descriptor(param, "user_def")?;

    if store
        .resolve(TableKind::User, &Referer::latest(&user.name))
        .is_ok()
    {
        return Err(FlowError::UserAlreadyExists { name: user.name });
    }

    store.insert_user(user, logged_in_user)
}

/// Insert the very first user without an authenticated creator. Used at
/// bootstrap when the user table is empty.
pub fn bootstrap_superuser(store: &EntityStore, name: &str, display_name: &str) -> Result<String> {
    store.insert_user(
        User {
            name: name.to_string(),
            display_name: display_name.to_string(),
            su: true,
        },
        "",
    )
}
