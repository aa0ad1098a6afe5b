use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::owner::Owner;

use super::conditions::{ConditionError, RuleConditions, parse_conditions};
use super::types::{NewRule, Rule};

const RULE_COLUMNS: &str =
    "id, name, description, conditions_json, created_at, updated_at, org_id, user_id";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("stored conditions are invalid: {0}")]
    InvalidConditions(#[from] ConditionError),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("a rule named {0:?} already exists")]
    DuplicateName(String),
}

#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, owner: Owner, new_rule: NewRule) -> Result<Rule, RuleError> {
        if self.get_by_name(owner, &new_rule.name).await?.is_some() {
            return Err(RuleError::DuplicateName(new_rule.name));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conditions_json = serde_json::to_string(&new_rule.conditions)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rules (
                        id, name, description, conditions_json, created_at, updated_at, org_id, user_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
                    RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    new_rule.name,
                    new_rule.description,
                    conditions_json,
                    now,
                    owner.org_id,
                    owner.user_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, owner: Owner, id: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS}
                     FROM rules
                     WHERE id = ?1 AND org_id = ?2 AND user_id = ?3"
                ),
                params![id, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_name(&self, owner: Owner, name: &str) -> Result<Option<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS}
                     FROM rules
                     WHERE name = ?1 AND org_id = ?2 AND user_id = ?3"
                ),
                params![name, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_rule(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, owner: Owner) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS}
                     FROM rules
                     WHERE org_id = ?1 AND user_id = ?2
                     ORDER BY created_at, name"
                ),
                params![owner.org_id, owner.user_id],
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    /// Replace a rule's name and conditions in one write. The description is kept.
    pub async fn update_definition(
        &self,
        owner: Owner,
        id: &str,
        name: &str,
        conditions: &RuleConditions,
    ) -> Result<Rule, RuleError> {
        if let Some(existing) = self.get_by_name(owner, name).await? {
            if existing.id != id {
                return Err(RuleError::DuplicateName(name.to_string()));
            }
        }

        let now = now_rfc3339();
        let conditions_json = serde_json::to_string(conditions)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE rules
                     SET name = ?1,
                         conditions_json = ?2,
                         updated_at = ?3
                     WHERE id = ?4 AND org_id = ?5 AND user_id = ?6
                     RETURNING {RULE_COLUMNS}"
                ),
                params![name, conditions_json, now, id, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn delete(&self, owner: Owner, id: &str) -> Result<(), RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM rules WHERE id = ?1 AND org_id = ?2 AND user_id = ?3 RETURNING id",
                params![id, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }
}

fn row_to_rule(row: Row) -> Result<Rule, RuleError> {
    let conditions_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let conditions = parse_conditions(&serde_json::from_str(&conditions_json)?)?;

    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        conditions,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        org_id: row.get(6)?,
        user_id: row.get(7)?,
    })
}
