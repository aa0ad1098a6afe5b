use std::fmt;

use serde::{Deserialize, Serialize};

/// Account context every rule, group and category is scoped to.
///
/// Passed explicitly into repositories, the repair registry and the diagnosis
/// orchestrator; nothing in the crate reads an ambient "current user".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub org_id: i64,
    pub user_id: i64,
}

impl Owner {
    pub fn new(org_id: i64, user_id: i64) -> Self {
        Self { org_id, user_id }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org_id, self.user_id)
    }
}
