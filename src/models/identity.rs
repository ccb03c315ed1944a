use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated identity a ledger belongs to.
///
/// Ownership is compared on the full `(user_id, session_id)` pair: the same
/// user with a new server session gets a new ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, None)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session_id) => write!(f, "{}@{}", self.user_id, session_id),
            None => write!(f, "{}", self.user_id),
        }
    }
}
