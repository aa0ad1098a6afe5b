//! Sender/subject groups referenced by rule group conditions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::email::{EmailSnapshot, domain_matches, extract_domain};
use crate::owner::Owner;

const GROUP_COLUMNS: &str = "id, name, prompt, created_at, updated_at, org_id, user_id";
const GROUP_ITEM_COLUMNS: &str = "id, group_id, item_type, value, position, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GroupItemType {
    #[serde(alias = "FROM")]
    From,
    #[serde(alias = "SUBJECT")]
    Subject,
}

impl GroupItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupItemType::From => "from",
            GroupItemType::Subject => "subject",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "from" => Some(Self::From),
            "subject" => Some(Self::Subject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupItem {
    pub id: String,
    pub group_id: String,
    pub item_type: GroupItemType,
    pub value: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

impl GroupItem {
    /// A FROM value starting with `@` matches the sender's domain and its
    /// subdomains; any other FROM value is a substring of the address.
    pub fn matches_sender(&self, sender: &str) -> bool {
        if self.item_type != GroupItemType::From {
            return false;
        }
        let sender = sender.trim().to_lowercase();
        let value = self.value.trim().to_lowercase();
        if value.is_empty() {
            return false;
        }
        match value.strip_prefix('@') {
            Some(domain) => extract_domain(&sender)
                .map(|sender_domain| domain_matches(sender_domain, domain))
                .unwrap_or(false),
            None => sender.contains(&value),
        }
    }

    pub fn matches_subject(&self, subject: &str) -> bool {
        self.item_type == GroupItemType::Subject
            && !self.value.trim().is_empty()
            && subject
                .to_lowercase()
                .contains(&self.value.trim().to_lowercase())
    }

    pub fn matches_email(&self, email: &EmailSnapshot) -> bool {
        match self.item_type {
            GroupItemType::From => self.matches_sender(email.sender_email()),
            GroupItemType::Subject => self.matches_subject(email.subject()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub org_id: i64,
    pub user_id: i64,
    pub name: String,
    pub prompt: Option<String>,
    pub items: Vec<GroupItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn matching_items<'a>(&'a self, email: &EmailSnapshot) -> Vec<&'a GroupItem> {
        self.items
            .iter()
            .filter(|item| item.matches_email(email))
            .collect()
    }

    pub fn contains_item(&self, item_type: GroupItemType, value: &str) -> bool {
        let value = normalize_item_value(value);
        self.items
            .iter()
            .any(|item| item.item_type == item_type && item.value == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub prompt: Option<String>,
}

pub fn is_member(group: &Group, sender: &str) -> bool {
    group.items.iter().any(|item| item.matches_sender(sender))
}

pub fn matches_email(group: &Group, email: &EmailSnapshot) -> bool {
    group.items.iter().any(|item| item.matches_email(email))
}

/// Stored form of an item value: trimmed and lowercased.
pub fn normalize_item_value(value: &str) -> String {
    value.trim().to_lowercase()
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("group not found: {0}")]
    NotFound(String),
    #[error("a group named {0:?} already exists")]
    DuplicateName(String),
    #[error("invalid group item type {0}")]
    InvalidItemType(String),
    #[error("group item value cannot be empty")]
    EmptyValue,
}

#[derive(Clone)]
pub struct GroupRepository {
    db: Database,
}

impl GroupRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, owner: Owner, new_group: NewGroup) -> Result<Group, GroupError> {
        if self.get_by_name(owner, &new_group.name).await?.is_some() {
            return Err(GroupError::DuplicateName(new_group.name));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO groups (id, name, prompt, created_at, updated_at, org_id, user_id)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)
                     RETURNING {GROUP_COLUMNS}"
                ),
                params![
                    id,
                    new_group.name,
                    new_group.prompt,
                    now,
                    owner.org_id,
                    owner.user_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_group(row, Vec::new()),
            None => Err(GroupError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, owner: Owner, id: &str) -> Result<Group, GroupError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS}
                     FROM groups
                     WHERE id = ?1 AND org_id = ?2 AND user_id = ?3"
                ),
                params![id, owner.org_id, owner.user_id],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| GroupError::NotFound(id.to_string()))?;
        let items = self.items_for_group(&conn, id).await?;
        row_to_group(row, items)
    }

    pub async fn get_by_name(&self, owner: Owner, name: &str) -> Result<Option<Group>, GroupError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM groups WHERE name = ?1 AND org_id = ?2 AND user_id = ?3",
                params![name, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let id: String = row.get(0)?;
                Ok(Some(self.get_by_id(owner, &id).await?))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self, owner: Owner) -> Result<Vec<Group>, GroupError> {
        let conn = self.db.connection().await?;
        let mut item_rows = conn
            .query(
                "SELECT gi.id, gi.group_id, gi.item_type, gi.value, gi.position, gi.created_at
                 FROM group_items gi
                 JOIN groups g ON g.id = gi.group_id
                 WHERE g.org_id = ?1 AND g.user_id = ?2
                 ORDER BY gi.position",
                params![owner.org_id, owner.user_id],
            )
            .await?;

        let mut items_by_group: HashMap<String, Vec<GroupItem>> = HashMap::new();
        while let Some(row) = item_rows.next().await? {
            let item = row_to_group_item(row)?;
            items_by_group
                .entry(item.group_id.clone())
                .or_default()
                .push(item);
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS}
                     FROM groups
                     WHERE org_id = ?1 AND user_id = ?2
                     ORDER BY name"
                ),
                params![owner.org_id, owner.user_id],
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let items = items_by_group.remove(&id).unwrap_or_default();
            groups.push(row_to_group(row, items)?);
        }
        Ok(groups)
    }

    pub async fn delete(&self, owner: Owner, id: &str) -> Result<(), GroupError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM groups WHERE id = ?1 AND org_id = ?2 AND user_id = ?3 RETURNING id",
                params![id, owner.org_id, owner.user_id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(GroupError::NotFound(id.to_string())),
        }
    }

    /// Insert an item unless an equal one exists. Returns whether a row was added.
    pub async fn add_member(
        &self,
        owner: Owner,
        group_id: &str,
        item_type: GroupItemType,
        value: &str,
    ) -> Result<bool, GroupError> {
        let value = normalize_item_value(value);
        if value.is_empty() {
            return Err(GroupError::EmptyValue);
        }

        let conn = self.db.connection().await?;
        self.ensure_owned(&conn, owner, group_id).await?;

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                "INSERT INTO group_items (id, group_id, item_type, value, position, created_at)
                 VALUES (
                    ?1, ?2, ?3, ?4,
                    (SELECT COALESCE(MAX(position), -1) + 1 FROM group_items WHERE group_id = ?2),
                    ?5
                 )
                 ON CONFLICT (group_id, item_type, value) DO NOTHING
                 RETURNING id",
                params![id, group_id, item_type.as_str(), value, now.clone()],
            )
            .await?;
        let inserted = rows.next().await?.is_some();
        drop(rows);

        if inserted {
            self.touch(&conn, group_id, &now).await?;
        }
        Ok(inserted)
    }

    /// Delete a matching item if present. Returns whether a row was removed.
    pub async fn remove_member(
        &self,
        owner: Owner,
        group_id: &str,
        item_type: GroupItemType,
        value: &str,
    ) -> Result<bool, GroupError> {
        let value = normalize_item_value(value);
        if value.is_empty() {
            return Err(GroupError::EmptyValue);
        }

        let conn = self.db.connection().await?;
        self.ensure_owned(&conn, owner, group_id).await?;

        let mut rows = conn
            .query(
                "DELETE FROM group_items
                 WHERE group_id = ?1 AND item_type = ?2 AND value = ?3
                 RETURNING id",
                params![group_id, item_type.as_str(), value],
            )
            .await?;
        let removed = rows.next().await?.is_some();
        drop(rows);

        if removed {
            self.touch(&conn, group_id, &now_rfc3339()).await?;
        }
        Ok(removed)
    }

    async fn ensure_owned(
        &self,
        conn: &libsql::Connection,
        owner: Owner,
        group_id: &str,
    ) -> Result<(), GroupError> {
        let mut rows = conn
            .query(
                "SELECT id FROM groups WHERE id = ?1 AND org_id = ?2 AND user_id = ?3",
                params![group_id, owner.org_id, owner.user_id],
            )
            .await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(GroupError::NotFound(group_id.to_string())),
        }
    }

    async fn touch(
        &self,
        conn: &libsql::Connection,
        group_id: &str,
        now: &str,
    ) -> Result<(), GroupError> {
        conn.execute(
            "UPDATE groups SET updated_at = ?1 WHERE id = ?2",
            params![now, group_id],
        )
        .await?;
        Ok(())
    }

    async fn items_for_group(
        &self,
        conn: &libsql::Connection,
        group_id: &str,
    ) -> Result<Vec<GroupItem>, GroupError> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {GROUP_ITEM_COLUMNS}
                     FROM group_items
                     WHERE group_id = ?1
                     ORDER BY position"
                ),
                params![group_id],
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_group_item(row)?);
        }
        Ok(items)
    }
}

fn row_to_group(row: Row, items: Vec<GroupItem>) -> Result<Group, GroupError> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        prompt: row.get(2)?,
        items,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        org_id: row.get(5)?,
        user_id: row.get(6)?,
    })
}

fn row_to_group_item(row: Row) -> Result<GroupItem, GroupError> {
    let item_type: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    let item_type = GroupItemType::from_str(&item_type)
        .ok_or_else(|| GroupError::InvalidItemType(item_type.clone()))?;

    Ok(GroupItem {
        id: row.get(0)?,
        group_id: row.get(1)?,
        item_type,
        value: row.get(3)?,
        position: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::Mailbox;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;

    const OWNER: Owner = Owner {
        org_id: 1,
        user_id: 1,
    };

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    fn item(item_type: GroupItemType, value: &str) -> GroupItem {
        GroupItem {
            id: Uuid::new_v4().to_string(),
            group_id: "group-1".into(),
            item_type,
            value: value.into(),
            position: 0,
            created_at: Utc::now(),
        }
    }

    fn group_with(items: Vec<GroupItem>) -> Group {
        Group {
            id: "group-1".into(),
            org_id: 1,
            user_id: 1,
            name: "Newsletters".into(),
            prompt: None,
            items,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn email(from: &str, subject: &str) -> EmailSnapshot {
        EmailSnapshot {
            id: "msg-1".into(),
            thread_id: None,
            message_id: None,
            references: None,
            from: Mailbox::parse(from),
            to: vec![Mailbox::new("me@example.com")],
            cc: vec![],
            subject: Some(subject.into()),
            date: None,
            headers: vec![],
            body_plain: None,
            body_html: None,
            attachments: vec![],
        }
    }

    #[test]
    fn domain_items_match_domain_and_subdomains() {
        let group = group_with(vec![item(GroupItemType::From, "@beehiiv.com")]);
        assert!(is_member(&group, "news@beehiiv.com"));
        assert!(is_member(&group, "News@Mail.Beehiiv.com"));
        assert!(!is_member(&group, "news@notbeehiiv.com"));
        assert!(!is_member(&group, "beehiiv.com@other.org"));
    }

    #[test]
    fn address_items_match_case_insensitive_substring() {
        let group = group_with(vec![item(GroupItemType::From, "david@hello.com")]);
        assert!(is_member(&group, "David@Hello.com"));
        assert!(!is_member(&group, "sarah@hello.com"));
    }

    #[test]
    fn subject_items_only_match_subjects() {
        let group = group_with(vec![item(GroupItemType::Subject, "weekly digest")]);
        assert!(!is_member(&group, "weekly digest"));
        assert!(matches_email(
            &group,
            &email("any@example.com", "Your Weekly Digest is here")
        ));
        assert!(!matches_email(&group, &email("any@example.com", "Invoice")));
    }

    #[tokio::test]
    async fn add_and_remove_items_are_idempotent() {
        let (db, _dir) = setup_db().await;
        let repo = GroupRepository::new(db);
        let group = repo
            .create(
                OWNER,
                NewGroup {
                    name: "Newsletters".into(),
                    prompt: Some("Newsletters and digests".into()),
                },
            )
            .await
            .expect("create");

        assert!(repo
            .add_member(OWNER, &group.id, GroupItemType::From, "@Beehiiv.com ")
            .await
            .expect("add"));
        assert!(!repo
            .add_member(OWNER, &group.id, GroupItemType::From, "@beehiiv.com")
            .await
            .expect("add again"));
        assert!(repo
            .add_member(OWNER, &group.id, GroupItemType::From, "david@hello.com")
            .await
            .expect("add second"));

        let fetched = repo.get_by_id(OWNER, &group.id).await.expect("fetch");
        let values: Vec<&str> = fetched.items.iter().map(|i| i.value.as_str()).collect();
        assert_eq!(values, vec!["@beehiiv.com", "david@hello.com"]);
        assert!(fetched.contains_item(GroupItemType::From, "DAVID@hello.com"));

        assert!(repo
            .remove_member(OWNER, &group.id, GroupItemType::From, "david@hello.com")
            .await
            .expect("remove"));
        assert!(!repo
            .remove_member(OWNER, &group.id, GroupItemType::From, "david@hello.com")
            .await
            .expect("remove again"));
        assert_eq!(
            repo.get_by_id(OWNER, &group.id).await.expect("fetch").items.len(),
            1
        );
    }

    #[tokio::test]
    async fn item_operations_require_owned_group_and_value() {
        let (db, _dir) = setup_db().await;
        let repo = GroupRepository::new(db);
        let group = repo
            .create(OWNER, NewGroup { name: "VIP".into(), prompt: None })
            .await
            .expect("create");

        let err = repo
            .add_member(Owner::new(9, 9), &group.id, GroupItemType::From, "a@b.com")
            .await
            .expect_err("foreign owner");
        assert!(matches!(err, GroupError::NotFound(_)));

        let err = repo
            .add_member(OWNER, &group.id, GroupItemType::Subject, "   ")
            .await
            .expect_err("blank");
        assert!(matches!(err, GroupError::EmptyValue));

        let err = repo
            .remove_member(OWNER, "missing", GroupItemType::From, "a@b.com")
            .await
            .expect_err("missing group");
        assert!(matches!(err, GroupError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_returns_items_and_delete_cascades() {
        let (db, _dir) = setup_db().await;
        let repo = GroupRepository::new(db.clone());
        let a = repo
            .create(OWNER, NewGroup { name: "A".into(), prompt: None })
            .await
            .expect("create a");
        let b = repo
            .create(OWNER, NewGroup { name: "B".into(), prompt: None })
            .await
            .expect("create b");
        repo.add_member(OWNER, &a.id, GroupItemType::From, "@a.com")
            .await
            .expect("add");
        repo.add_member(OWNER, &b.id, GroupItemType::Subject, "hello")
            .await
            .expect("add");

        let groups = repo.list(OWNER).await.expect("list");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].items[0].value, "@a.com");
        assert_eq!(groups[1].items[0].item_type, GroupItemType::Subject);

        let err = repo
            .create(OWNER, NewGroup { name: "A".into(), prompt: None })
            .await
            .expect_err("duplicate");
        assert!(matches!(err, GroupError::DuplicateName(_)));

        repo.delete(OWNER, &a.id).await.expect("delete");
        let conn = db.connection().await.expect("conn");
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM group_items WHERE group_id = ?1",
                params![a.id.clone()],
            )
            .await
            .expect("count");
        let count: i64 = rows
            .next()
            .await
            .expect("row")
            .expect("value")
            .get(0)
            .expect("count");
        assert_eq!(count, 0);
    }
}
