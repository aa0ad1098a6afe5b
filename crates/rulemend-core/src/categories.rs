//! Sender categories and the sender→category assignment map.

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::email::normalize_address;
use crate::owner::Owner;

const CATEGORY_COLUMNS: &str = "id, name, description, created_at, updated_at, org_id, user_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub org_id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("category not found: {0}")]
    NotFound(String),
    #[error("a category named {0:?} already exists")]
    DuplicateName(String),
    #[error("sender address cannot be empty")]
    EmptySender,
}

#[derive(Clone)]
pub struct CategoryRepository {
    db: Database,
}

impl CategoryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        owner: Owner,
        new_category: NewCategory,
    ) -> Result<Category, CategoryError> {
        if self.get_by_name(owner, &new_category.name).await?.is_some() {
            return Err(CategoryError::DuplicateName(new_category.name));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO categories (id, name, description, created_at, updated_at, org_id, user_id)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)
                     RETURNING {CATEGORY_COLUMNS}"
                ),
                params![
                    id,
                    new_category.name.trim(),
                    new_category.description,
                    now,
                    owner.org_id,
                    owner.user_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_category(row),
            None => Err(CategoryError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, owner: Owner, id: &str) -> Result<Category, CategoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CATEGORY_COLUMNS}
                     FROM categories
                     WHERE id = ?1 AND org_id = ?2 AND user_id = ?3"
                ),
                params![id, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_category(row),
            None => Err(CategoryError::NotFound(id.to_string())),
        }
    }

    /// Case-insensitive lookup by display name.
    pub async fn get_by_name(
        &self,
        owner: Owner,
        name: &str,
    ) -> Result<Option<Category>, CategoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CATEGORY_COLUMNS}
                     FROM categories
                     WHERE name = ?1 COLLATE NOCASE AND org_id = ?2 AND user_id = ?3"
                ),
                params![name.trim(), owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_category(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, owner: Owner) -> Result<Vec<Category>, CategoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CATEGORY_COLUMNS}
                     FROM categories
                     WHERE org_id = ?1 AND user_id = ?2
                     ORDER BY name COLLATE NOCASE"
                ),
                params![owner.org_id, owner.user_id],
            )
            .await?;

        let mut categories = Vec::new();
        while let Some(row) = rows.next().await? {
            categories.push(row_to_category(row)?);
        }
        Ok(categories)
    }

    pub async fn get_sender_category(
        &self,
        owner: Owner,
        sender: &str,
    ) -> Result<Option<Category>, CategoryError> {
        let sender = normalize_address(sender);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT c.id, c.name, c.description, c.created_at, c.updated_at, c.org_id, c.user_id
                 FROM sender_categories sc
                 JOIN categories c ON c.id = sc.category_id
                 WHERE sc.org_id = ?1 AND sc.user_id = ?2 AND sc.sender_email = ?3",
                params![owner.org_id, owner.user_id, sender],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_category(row)?)),
            None => Ok(None),
        }
    }

    /// Assign `category_id` to the sender, replacing any previous assignment.
    /// Returns whether the stored assignment changed.
    pub async fn set_sender_category(
        &self,
        owner: Owner,
        sender: &str,
        category_id: &str,
    ) -> Result<bool, CategoryError> {
        let sender = normalize_address(sender);
        if sender.is_empty() {
            return Err(CategoryError::EmptySender);
        }
        let category = self.get_by_id(owner, category_id).await?;

        if let Some(current) = self.get_sender_category(owner, &sender).await? {
            if current.id == category.id {
                return Ok(false);
            }
        }

        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO sender_categories (org_id, user_id, sender_email, category_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (org_id, user_id, sender_email)
             DO UPDATE SET category_id = excluded.category_id, updated_at = excluded.updated_at",
            params![
                owner.org_id,
                owner.user_id,
                sender,
                category.id,
                now_rfc3339()
            ],
        )
        .await?;
        Ok(true)
    }
}

fn row_to_category(row: Row) -> Result<Category, CategoryError> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        org_id: row.get(5)?,
        user_id: row.get(6)?,
    })
}
