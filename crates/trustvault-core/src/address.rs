//! Identifiers of the form `user@host/resource`.

use serde::{Deserialize, Serialize};
use std::fmt;

const RESOURCE_SEPARATOR: char = '/';

/// True when the id names one connected endpoint rather than the account.
pub fn has_resource(id: &str) -> bool {
    match id.split_once(RESOURCE_SEPARATOR) {
        Some((bare, resource)) => !bare.is_empty() && !resource.is_empty(),
        None => false,
    }
}

pub fn strip_resource(id: &str) -> &str {
    match id.split_once(RESOURCE_SEPARATOR) {
        Some((bare, _)) => bare,
        None => id,
    }
}

/// A conversation between a local account and one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub account_id: String,
    /// Bare remote account.
    pub user_id: String,
    /// Remote account including the resource.
    pub full_user_id: String,
    pub protocol: String,
}

impl SessionId {
    pub fn new(account_id: &str, full_user_id: &str, protocol: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            user_id: strip_resource(full_user_id).to_string(),
            full_user_id: full_user_id.to_string(),
            protocol: protocol.to_string(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.protocol, self.account_id, self.full_user_id)
    }
}
