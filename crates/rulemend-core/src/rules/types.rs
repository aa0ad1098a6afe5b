use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::owner::Owner;

use super::conditions::RuleConditions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub org_id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub conditions: RuleConditions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn owner(&self) -> Owner {
        Owner::new(self.org_id, self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub description: Option<String>,
    pub conditions: RuleConditions,
}
