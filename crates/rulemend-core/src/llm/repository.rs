use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::owner::Owner;

const LLM_CALL_COLUMNS: &str = "id, org_id, user_id, feature, context_json, model, request_json, response_json, input_tokens, output_tokens, latency_ms, error, trace_id, created_at";
const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum LlmCallError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("insert failed: {0}")]
    InsertFailed(String),
}

/// What a reasoning call was made for; stored alongside every logged call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmCallContext {
    /// Feature name, e.g. "rule_diagnosis".
    pub feature: String,
    pub org_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub rule_name: Option<String>,
    #[serde(default)]
    pub round: Option<u32>,
}

impl LlmCallContext {
    pub fn new(feature: impl Into<String>, owner: Owner) -> Self {
        Self {
            feature: feature.into(),
            org_id: owner.org_id,
            user_id: owner.user_id,
            session_id: None,
            message_id: None,
            rule_id: None,
            rule_name: None,
            round: None,
        }
    }

    pub fn owner(&self) -> Owner {
        Owner::new(self.org_id, self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewLlmCall {
    pub context: LlmCallContext,
    pub model: String,
    pub request_json: Value,
    pub response_json: Option<Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmCall {
    pub id: String,
    pub org_id: i64,
    pub user_id: i64,
    pub feature: String,
    pub context: LlmCallContext,
    pub model: String,
    pub request_json: Value,
    pub response_json: Option<Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit log of reasoning-service calls.
#[derive(Clone)]
pub struct LlmCallRepository {
    db: Database,
}

impl LlmCallRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, call: NewLlmCall) -> Result<LlmCall, LlmCallError> {
        let id = Uuid::new_v4().to_string();
        let context_json = serde_json::to_string(&call.context)?;
        let request_json = serde_json::to_string(&call.request_json)?;
        let response_json = call
            .response_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO llm_calls (
                        id, org_id, user_id, feature, context_json, model, request_json, response_json,
                        input_tokens, output_tokens, latency_ms, error, trace_id, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                    RETURNING {LLM_CALL_COLUMNS}"
                ),
                params![
                    id,
                    call.context.org_id,
                    call.context.user_id,
                    call.context.feature.clone(),
                    context_json,
                    call.model,
                    request_json,
                    response_json,
                    call.input_tokens.map(i64::from),
                    call.output_tokens.map(i64::from),
                    call.latency_ms.map(|v| v as i64),
                    call.error,
                    call.trace_id,
                    now_rfc3339(),
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_llm_call(row),
            None => Err(LlmCallError::InsertFailed("no rows returned".into())),
        }
    }

    /// Most recent calls first.
    pub async fn list(
        &self,
        owner: Owner,
        feature: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<LlmCall>, LlmCallError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LLM_CALL_COLUMNS}
                     FROM llm_calls
                     WHERE org_id = ?1 AND user_id = ?2 AND (?3 IS NULL OR feature = ?3)
                     ORDER BY created_at DESC
                     LIMIT ?4"
                ),
                params![
                    owner.org_id,
                    owner.user_id,
                    feature,
                    limit.unwrap_or(DEFAULT_LIST_LIMIT)
                ],
            )
            .await?;

        let mut calls = Vec::new();
        while let Some(row) = rows.next().await? {
            calls.push(row_to_llm_call(row)?);
        }
        Ok(calls)
    }
}

fn row_to_llm_call(row: Row) -> Result<LlmCall, LlmCallError> {
    let context_json: String = row.get(4)?;
    let request_json: String = row.get(6)?;
    let response_json: Option<String> = row.get(7)?;
    let input_tokens: Option<i64> = row.get(8)?;
    let output_tokens: Option<i64> = row.get(9)?;
    let latency_ms: Option<i64> = row.get(10)?;
    let created_at: String = row.get(13)?;

    Ok(LlmCall {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        feature: row.get(3)?,
        context: serde_json::from_str(&context_json)?,
        model: row.get(5)?,
        request_json: serde_json::from_str(&request_json)?,
        response_json: response_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        input_tokens: input_tokens.and_then(|v| u32::try_from(v).ok()),
        output_tokens: output_tokens.and_then(|v| u32::try_from(v).ok()),
        latency_ms: latency_ms.and_then(|v| u64::try_from(v).ok()),
        error: row.get(11)?,
        trace_id: row.get(12)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
