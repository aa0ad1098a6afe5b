//! Pure rule evaluation against a single email.
//!
//! AI-instruction conditions are never judged here; they come back as deferred
//! and the combined verdict is `Indeterminate` unless another condition settles
//! the operator on its own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::categories::Category;
use crate::email::{EmailSnapshot, domain_matches, extract_domain, normalize_address};
use crate::groups::Group;

use super::conditions::{
    CategoryCondition, CategoryFilterType, ConditionGroup, ConditionKind, GroupCondition,
    LogicalOperator, RuleConditions, StaticCondition,
};

/// Everything outside the email itself that evaluation needs.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub sender_category: Option<Category>,
    pub groups: HashMap<String, Group>,
}

impl EvaluationContext {
    pub fn new(sender_category: Option<Category>, groups: impl IntoIterator<Item = Group>) -> Self {
        Self {
            sender_category,
            groups: groups
                .into_iter()
                .map(|group| (group.id.clone(), group))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Matched,
    NotMatched,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionVerdict {
    pub kind: ConditionKind,
    pub outcome: ConditionOutcome,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Matched,
    NotMatched,
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Matched => "matched",
            Verdict::NotMatched => "not_matched",
            Verdict::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub operator: LogicalOperator,
    pub verdict: Verdict,
    pub breakdown: Vec<ConditionVerdict>,
}

impl MatchResult {
    pub fn has_deferred(&self) -> bool {
        self.breakdown
            .iter()
            .any(|verdict| verdict.outcome == ConditionOutcome::Deferred)
    }

    /// Recompute the verdict with an externally judged AI outcome substituted for
    /// every deferred condition.
    pub fn resolve_deferred(&self, ai_matched: bool) -> Verdict {
        let resolved = if ai_matched {
            ConditionOutcome::Matched
        } else {
            ConditionOutcome::NotMatched
        };
        let outcomes = self.breakdown.iter().map(|verdict| match verdict.outcome {
            ConditionOutcome::Deferred => resolved,
            other => other,
        });
        combine(self.operator, outcomes)
    }
}

pub fn evaluate(
    conditions: &RuleConditions,
    email: &EmailSnapshot,
    context: &EvaluationContext,
) -> MatchResult {
    let breakdown: Vec<ConditionVerdict> = conditions
        .groups()
        .iter()
        .map(|group| group.evaluate(email, context))
        .collect();
    let verdict = combine(
        conditions.operator(),
        breakdown.iter().map(|verdict| verdict.outcome),
    );

    MatchResult {
        operator: conditions.operator(),
        verdict,
        breakdown,
    }
}

fn combine(
    operator: LogicalOperator,
    outcomes: impl IntoIterator<Item = ConditionOutcome>,
) -> Verdict {
    let outcomes: Vec<ConditionOutcome> = outcomes.into_iter().collect();
    if outcomes.is_empty() {
        return Verdict::NotMatched;
    }
    let deferred = outcomes.contains(&ConditionOutcome::Deferred);

    match operator {
        LogicalOperator::And => {
            if outcomes.contains(&ConditionOutcome::NotMatched) {
                Verdict::NotMatched
            } else if deferred {
                Verdict::Indeterminate
            } else {
                Verdict::Matched
            }
        }
        LogicalOperator::Or => {
            if outcomes.contains(&ConditionOutcome::Matched) {
                Verdict::Matched
            } else if deferred {
                Verdict::Indeterminate
            } else {
                Verdict::NotMatched
            }
        }
    }
}

impl ConditionGroup<'_> {
    pub fn evaluate(&self, email: &EmailSnapshot, context: &EvaluationContext) -> ConditionVerdict {
        let (outcome, reason) = match self {
            ConditionGroup::Static(condition) => evaluate_static(condition, email),
            ConditionGroup::Group(condition) => evaluate_group(condition, email, context),
            ConditionGroup::Category(condition) => evaluate_category(condition, context),
            ConditionGroup::Ai(condition) => (
                ConditionOutcome::Deferred,
                format!(
                    "AI instructions {:?} require semantic judgment",
                    condition.instructions
                ),
            ),
        };
        ConditionVerdict {
            kind: self.kind(),
            outcome,
            reason,
        }
    }
}

fn outcome_of(matched: bool) -> ConditionOutcome {
    if matched {
        ConditionOutcome::Matched
    } else {
        ConditionOutcome::NotMatched
    }
}

fn evaluate_static(condition: &StaticCondition, email: &EmailSnapshot) -> (ConditionOutcome, String) {
    let mut failures = Vec::new();

    for (field, pattern) in condition.matchers() {
        let matched = match field {
            "from" => address_matches(pattern, email.sender_email()),
            "to" => email
                .to
                .iter()
                .any(|mailbox| address_matches(pattern, &mailbox.email)),
            "subject" => contains_ignore_case(email.subject(), pattern),
            _ => email_body_contains(email, pattern),
        };
        if !matched {
            failures.push(format!("{field} does not match {pattern:?}"));
        }
    }

    if failures.is_empty() {
        let fields: Vec<&str> = condition.matchers().iter().map(|(field, _)| *field).collect();
        (
            ConditionOutcome::Matched,
            format!("static matchers on {} all match", fields.join(", ")),
        )
    } else {
        (ConditionOutcome::NotMatched, failures.join("; "))
    }
}

fn evaluate_group(
    condition: &GroupCondition,
    email: &EmailSnapshot,
    context: &EvaluationContext,
) -> (ConditionOutcome, String) {
    let Some(group) = context.groups.get(&condition.group_id) else {
        return (
            ConditionOutcome::NotMatched,
            format!("referenced group {} does not exist", condition.group_id),
        );
    };

    let matching = group.matching_items(email);
    let reason = match matching.first() {
        Some(item) => format!(
            "group {:?} item {} {:?} matches",
            group.name,
            item.item_type.as_str(),
            item.value
        ),
        None => format!(
            "no item of group {:?} matches sender {} or the subject",
            group.name,
            email.sender_email()
        ),
    };
    (outcome_of(!matching.is_empty()), reason)
}

fn evaluate_category(
    condition: &CategoryCondition,
    context: &EvaluationContext,
) -> (ConditionOutcome, String) {
    let in_set = context
        .sender_category
        .as_ref()
        .is_some_and(|category| condition.category_ids.contains(&category.id));
    let current = context
        .sender_category
        .as_ref()
        .map(|category| format!("{:?}", category.name))
        .unwrap_or_else(|| "no category".to_string());

    match condition.filter_type {
        CategoryFilterType::Include => (
            outcome_of(in_set),
            if in_set {
                format!("sender category {current} is included")
            } else {
                format!("sender has {current}, which is not in the included set")
            },
        ),
        CategoryFilterType::Exclude => (
            outcome_of(!in_set),
            if in_set {
                format!("sender category {current} is excluded")
            } else {
                format!("sender has {current}, which is not excluded")
            },
        ),
    }
}

/// `@domain` or a bare domain matches the domain and its subdomains; anything
/// else must equal the address.
fn address_matches(pattern: &str, address: &str) -> bool {
    let address = normalize_address(address);
    let pattern = normalize_address(pattern);
    if pattern.is_empty() || address.is_empty() {
        return false;
    }

    let domain_pattern = match pattern.strip_prefix('@') {
        Some(domain) => Some(domain),
        None if !pattern.contains('@') => Some(pattern.as_str()),
        None => None,
    };

    match domain_pattern {
        Some(domain) => extract_domain(&address).is_some_and(|found| domain_matches(found, domain)),
        None => address == pattern,
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn email_body_contains(email: &EmailSnapshot, needle: &str) -> bool {
    [email.body_plain.as_deref(), email.body_html.as_deref()]
        .into_iter()
        .flatten()
        .any(|body| contains_ignore_case(body, needle))
}
