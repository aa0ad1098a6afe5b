use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

impl LogicalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOperator::And => "and",
            LogicalOperator::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CategoryFilterType {
    #[serde(alias = "INCLUDE")]
    Include,
    #[serde(alias = "EXCLUDE")]
    Exclude,
}

impl CategoryFilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryFilterType::Include => "include",
            CategoryFilterType::Exclude => "exclude",
        }
    }
}

/// Free-text instruction judged by the reasoning service, never in-core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiCondition {
    pub instructions: String,
}

/// Header/body matchers. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl StaticCondition {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none() && self.subject.is_none() && self.body.is_none()
    }

    /// Populated matchers as `(field, value)` pairs, in header order.
    pub fn matchers(&self) -> Vec<(&'static str, &str)> {
        [
            ("from", self.from.as_deref()),
            ("to", self.to.as_deref()),
            ("subject", self.subject.as_deref()),
            ("body", self.body.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|value| (field, value)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCondition {
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCondition {
    pub filter_type: CategoryFilterType,
    pub category_ids: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("invalid condition json: {0}")]
    InvalidJson(String),
    #[error("static {0} matcher cannot be empty; omit it instead")]
    EmptyMatcher(&'static str),
    #[error("ai instructions cannot be empty; omit them instead")]
    EmptyInstructions,
    #[error("group reference cannot be empty")]
    EmptyGroupId,
    #[error("category filter requires at least one category")]
    EmptyCategoryFilter,
    #[error("a rule combined with AND requires at least one condition")]
    NoConditions,
}

/// Unvalidated, freely editable form of a rule's conditions. This is also the
/// persisted JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionParts {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_instructions: Option<String>,
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_conditions: Option<StaticCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<CategoryCondition>,
}

/// Validated condition set of a rule.
///
/// Only constructible through [`TryFrom<ConditionParts>`], so every value in the
/// crate satisfies the invariants: no blank matcher, no empty category filter, and
/// an AND rule always has at least one populated condition group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConditionParts", into = "ConditionParts")]
pub struct RuleConditions {
    operator: LogicalOperator,
    ai: Option<AiCondition>,
    static_conditions: Option<StaticCondition>,
    group: Option<GroupCondition>,
    category: Option<CategoryCondition>,
}

/// One populated sub-clause of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionGroup<'a> {
    Static(&'a StaticCondition),
    Group(&'a GroupCondition),
    Category(&'a CategoryCondition),
    Ai(&'a AiCondition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Static,
    Group,
    Category,
    Ai,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Static => "static",
            ConditionKind::Group => "group",
            ConditionKind::Category => "category",
            ConditionKind::Ai => "ai",
        }
    }
}

impl ConditionGroup<'_> {
    pub fn kind(&self) -> ConditionKind {
        match self {
            ConditionGroup::Static(_) => ConditionKind::Static,
            ConditionGroup::Group(_) => ConditionKind::Group,
            ConditionGroup::Category(_) => ConditionKind::Category,
            ConditionGroup::Ai(_) => ConditionKind::Ai,
        }
    }
}

impl RuleConditions {
    pub fn operator(&self) -> LogicalOperator {
        self.operator
    }

    pub fn ai(&self) -> Option<&AiCondition> {
        self.ai.as_ref()
    }

    pub fn static_conditions(&self) -> Option<&StaticCondition> {
        self.static_conditions.as_ref()
    }

    pub fn group(&self) -> Option<&GroupCondition> {
        self.group.as_ref()
    }

    pub fn category(&self) -> Option<&CategoryCondition> {
        self.category.as_ref()
    }

    /// Populated condition groups; deterministic groups first, AI last.
    pub fn groups(&self) -> Vec<ConditionGroup<'_>> {
        let mut groups = Vec::with_capacity(4);
        if let Some(static_conditions) = &self.static_conditions {
            groups.push(ConditionGroup::Static(static_conditions));
        }
        if let Some(group) = &self.group {
            groups.push(ConditionGroup::Group(group));
        }
        if let Some(category) = &self.category {
            groups.push(ConditionGroup::Category(category));
        }
        if let Some(ai) = &self.ai {
            groups.push(ConditionGroup::Ai(ai));
        }
        groups
    }

    pub fn is_empty(&self) -> bool {
        self.ai.is_none()
            && self.static_conditions.is_none()
            && self.group.is_none()
            && self.category.is_none()
    }

    /// Editable copy for building a replacement condition set.
    pub fn to_parts(&self) -> ConditionParts {
        ConditionParts::from(self.clone())
    }
}

impl From<RuleConditions> for ConditionParts {
    fn from(conditions: RuleConditions) -> Self {
        ConditionParts {
            operator: conditions.operator,
            ai_instructions: conditions.ai.map(|ai| ai.instructions),
            static_conditions: conditions.static_conditions,
            group_id: conditions.group.map(|group| group.group_id),
            category: conditions.category,
        }
    }
}

impl TryFrom<ConditionParts> for RuleConditions {
    type Error = ConditionError;

    fn try_from(parts: ConditionParts) -> Result<Self, Self::Error> {
        let ai = match parts.ai_instructions {
            Some(text) if text.trim().is_empty() => return Err(ConditionError::EmptyInstructions),
            Some(instructions) => Some(AiCondition { instructions }),
            None => None,
        };

        let static_conditions = match parts.static_conditions {
            Some(conditions) => {
                for (field, value) in conditions.matchers() {
                    if value.trim().is_empty() {
                        return Err(ConditionError::EmptyMatcher(field));
                    }
                }
                (!conditions.is_empty()).then_some(conditions)
            }
            None => None,
        };

        let group = match parts.group_id {
            Some(id) if id.trim().is_empty() => return Err(ConditionError::EmptyGroupId),
            Some(group_id) => Some(GroupCondition { group_id }),
            None => None,
        };

        if let Some(category) = &parts.category {
            if category.category_ids.iter().all(|id| id.trim().is_empty()) {
                return Err(ConditionError::EmptyCategoryFilter);
            }
        }

        let conditions = RuleConditions {
            operator: parts.operator,
            ai,
            static_conditions,
            group,
            category: parts.category,
        };

        if conditions.operator == LogicalOperator::And && conditions.is_empty() {
            return Err(ConditionError::NoConditions);
        }

        Ok(conditions)
    }
}

/// Parse and validate a persisted `conditions_json` document.
pub fn parse_conditions(value: &Value) -> Result<RuleConditions, ConditionError> {
    let parts: ConditionParts = serde_json::from_value(value.clone())
        .map_err(|err| ConditionError::InvalidJson(err.to_string()))?;
    RuleConditions::try_from(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parts_with_static(from: Option<&str>, subject: Option<&str>) -> ConditionParts {
        ConditionParts {
            static_conditions: Some(StaticCondition {
                from: from.map(str::to_string),
                subject: subject.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn and_rule_without_conditions_is_rejected() {
        let err = RuleConditions::try_from(ConditionParts::default()).unwrap_err();
        assert_eq!(err, ConditionError::NoConditions);
    }

    #[test]
    fn or_rule_without_conditions_is_allowed_but_empty() {
        let conditions = RuleConditions::try_from(ConditionParts {
            operator: LogicalOperator::Or,
            ..Default::default()
        })
        .expect("or rule");
        assert!(conditions.is_empty());
        assert!(conditions.groups().is_empty());
    }

    #[test]
    fn empty_static_matcher_is_rejected() {
        let err = RuleConditions::try_from(parts_with_static(Some(""), None)).unwrap_err();
        assert_eq!(err, ConditionError::EmptyMatcher("from"));

        let err = RuleConditions::try_from(parts_with_static(None, Some("   "))).unwrap_err();
        assert_eq!(err, ConditionError::EmptyMatcher("subject"));
    }

    #[test]
    fn static_condition_with_no_matchers_counts_as_absent() {
        let mut parts = parts_with_static(None, None);
        parts.ai_instructions = Some("Newsletters".into());
        let conditions = RuleConditions::try_from(parts).expect("valid");
        assert!(conditions.static_conditions().is_none());
        assert_eq!(conditions.groups().len(), 1);
    }

    #[test]
    fn blank_ai_instructions_are_rejected() {
        let err = RuleConditions::try_from(ConditionParts {
            ai_instructions: Some(" ".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, ConditionError::EmptyInstructions);
    }

    #[test]
    fn empty_category_filter_is_rejected() {
        let err = RuleConditions::try_from(ConditionParts {
            category: Some(CategoryCondition {
                filter_type: CategoryFilterType::Include,
                category_ids: vec![],
            }),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, ConditionError::EmptyCategoryFilter);
    }

    #[test]
    fn groups_are_ordered_with_ai_last() {
        let conditions = RuleConditions::try_from(ConditionParts {
            operator: LogicalOperator::Or,
            ai_instructions: Some("Receipts from online stores".into()),
            static_conditions: Some(StaticCondition {
                subject: Some("receipt".into()),
                ..Default::default()
            }),
            group_id: Some("group-1".into()),
            category: Some(CategoryCondition {
                filter_type: CategoryFilterType::Exclude,
                category_ids: vec!["cat-1".into()],
            }),
        })
        .expect("valid");

        let kinds: Vec<ConditionKind> = conditions.groups().iter().map(|g| g.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ConditionKind::Static,
                ConditionKind::Group,
                ConditionKind::Category,
                ConditionKind::Ai
            ]
        );
        assert_eq!(conditions.operator(), LogicalOperator::Or);
    }

    #[test]
    fn parse_accepts_uppercase_enums() {
        let conditions = parse_conditions(&json!({
            "operator": "OR",
            "static": { "from": "@beehiiv.com" },
            "category": { "filter_type": "INCLUDE", "category_ids": ["cat-1"] }
        }))
        .expect("parse");
        assert_eq!(conditions.operator(), LogicalOperator::Or);
        assert_eq!(
            conditions.category().map(|c| c.filter_type),
            Some(CategoryFilterType::Include)
        );
    }

    #[test]
    fn parse_rejects_invalid_documents() {
        assert!(matches!(
            parse_conditions(&json!({"operator": "xor"})),
            Err(ConditionError::InvalidJson(_))
        ));
        assert_eq!(
            parse_conditions(&json!({})).unwrap_err(),
            ConditionError::NoConditions
        );
    }

    #[test]
    fn serde_round_trip_preserves_persisted_shape() {
        let value = json!({
            "operator": "and",
            "ai_instructions": "Emails about invoices",
            "static": { "subject": "invoice" },
            "group_id": "group-1"
        });
        let conditions: RuleConditions = serde_json::from_value(value.clone()).expect("decode");
        assert_eq!(serde_json::to_value(&conditions).expect("encode"), value);
    }

    #[test]
    fn serde_deserialize_enforces_invariants() {
        let result: Result<RuleConditions, _> =
            serde_json::from_value(json!({"static": {"body": ""}}));
        assert!(result.is_err());
    }
}
