use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::categories::{CategoryError, CategoryRepository};
use crate::db::Database;
use crate::email::normalize_address;
use crate::groups::{GroupError, GroupRepository};
use crate::owner::Owner;
use crate::rules::{RuleConditions, RuleError, RuleRepository, StaticCondition};

use super::actions::{ChangeSenderCategoryArgs, EditRuleArgs, GroupItemArgs, RepairAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Unchanged,
}

impl ActionOutcome {
    fn from_changed(changed: bool) -> Self {
        if changed {
            ActionOutcome::Applied
        } else {
            ActionOutcome::Unchanged
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Applied => "applied",
            ActionOutcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("edit would leave the rule invalid: {0}")]
    InvalidRuleState(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RuleError> for RepairError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::NotFound(id) => RepairError::NotFound(format!("rule {id}")),
            RuleError::DuplicateName(name) => {
                RepairError::InvalidArguments(format!("another rule is already named {name:?}"))
            }
            other => RepairError::Storage(other.to_string()),
        }
    }
}

impl From<GroupError> for RepairError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::NotFound(id) => RepairError::NotFound(format!("group {id}")),
            GroupError::EmptyValue => {
                RepairError::InvalidArguments("group item value cannot be empty".into())
            }
            other => RepairError::Storage(other.to_string()),
        }
    }
}

impl From<CategoryError> for RepairError {
    fn from(err: CategoryError) -> Self {
        match err {
            CategoryError::NotFound(id) => RepairError::NotFound(format!("category {id}")),
            CategoryError::EmptySender => {
                RepairError::InvalidArguments("sender address cannot be empty".into())
            }
            other => RepairError::Storage(other.to_string()),
        }
    }
}

/// Validates and applies repair actions.
///
/// Applies for one owner are serialized through a per-owner async mutex held
/// only for the duration of a single action.
#[derive(Clone)]
pub struct RepairActionRegistry {
    rules: RuleRepository,
    groups: GroupRepository,
    categories: CategoryRepository,
    locks: Arc<Mutex<HashMap<Owner, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepairActionRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            rules: RuleRepository::new(db.clone()),
            groups: GroupRepository::new(db.clone()),
            categories: CategoryRepository::new(db),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn apply(
        &self,
        owner: Owner,
        action: &RepairAction,
    ) -> Result<ActionOutcome, RepairError> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;

        let result = match action {
            RepairAction::EditRule(args) => self.edit_rule(owner, args).await,
            RepairAction::AddToGroup(args) => self.add_to_group(owner, args).await,
            RepairAction::RemoveFromGroup(args) => self.remove_from_group(owner, args).await,
            RepairAction::ChangeSenderCategory(args) => {
                self.change_sender_category(owner, args).await
            }
        };

        match &result {
            Ok(outcome) => info!(
                owner = %owner,
                action = action.tool_name(),
                target = %action.target(),
                outcome = outcome.as_str(),
                "repair action applied"
            ),
            Err(err) => warn!(
                owner = %owner,
                action = action.tool_name(),
                target = %action.target(),
                error = %err,
                "repair action rejected"
            ),
        }
        result
    }

    fn owner_lock(&self, owner: Owner) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(owner).or_default().clone()
    }

    async fn edit_rule(
        &self,
        owner: Owner,
        args: &EditRuleArgs,
    ) -> Result<ActionOutcome, RepairError> {
        let rule = self.rules.get_by_id(owner, args.rule_id.trim()).await?;

        let name = match args.name.as_deref().map(str::trim) {
            Some("") => {
                return Err(RepairError::InvalidArguments(
                    "rule name cannot be empty".into(),
                ));
            }
            Some(name) => name.to_string(),
            None => rule.name.clone(),
        };

        let conditions = patch_conditions(&rule.conditions, args)?;
        if name == rule.name && conditions == rule.conditions {
            return Ok(ActionOutcome::Unchanged);
        }

        self.rules
            .update_definition(owner, &rule.id, &name, &conditions)
            .await?;
        Ok(ActionOutcome::Applied)
    }

    async fn add_to_group(
        &self,
        owner: Owner,
        args: &GroupItemArgs,
    ) -> Result<ActionOutcome, RepairError> {
        require_value(&args.value, "group item value")?;
        let added = self
            .groups
            .add_member(owner, args.group_id.trim(), args.item_type, &args.value)
            .await?;
        Ok(ActionOutcome::from_changed(added))
    }

    async fn remove_from_group(
        &self,
        owner: Owner,
        args: &GroupItemArgs,
    ) -> Result<ActionOutcome, RepairError> {
        require_value(&args.value, "group item value")?;
        let removed = self
            .groups
            .remove_member(owner, args.group_id.trim(), args.item_type, &args.value)
            .await?;
        Ok(ActionOutcome::from_changed(removed))
    }

    async fn change_sender_category(
        &self,
        owner: Owner,
        args: &ChangeSenderCategoryArgs,
    ) -> Result<ActionOutcome, RepairError> {
        let sender = normalize_address(&args.sender);
        require_value(&sender, "sender address")?;
        require_value(&args.category_name, "category name")?;

        let category = self
            .categories
            .get_by_name(owner, &args.category_name)
            .await?
            .ok_or_else(|| RepairError::NotFound(format!("category {:?}", args.category_name)))?;

        let changed = self
            .categories
            .set_sender_category(owner, &sender, &category.id)
            .await?;
        Ok(ActionOutcome::from_changed(changed))
    }
}

fn require_value(value: &str, what: &str) -> Result<(), RepairError> {
    if value.trim().is_empty() {
        Err(RepairError::InvalidArguments(format!("{what} cannot be empty")))
    } else {
        Ok(())
    }
}

/// `Some(None)` and `Some(Some(""))` both clear the field.
fn patch_field(target: &mut Option<String>, patch: &Option<Option<String>>) {
    if let Some(value) = patch {
        *target = value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
    }
}

fn patch_conditions(
    current: &RuleConditions,
    args: &EditRuleArgs,
) -> Result<RuleConditions, RepairError> {
    let mut parts = current.to_parts();

    patch_field(&mut parts.ai_instructions, &args.ai_instructions);

    let mut static_conditions: StaticCondition = parts.static_conditions.take().unwrap_or_default();
    patch_field(&mut static_conditions.from, &args.from);
    patch_field(&mut static_conditions.to, &args.to);
    patch_field(&mut static_conditions.subject, &args.subject);
    patch_field(&mut static_conditions.body, &args.body);
    parts.static_conditions = Some(static_conditions);

    if let Some(operator) = args.conditional_operator {
        parts.operator = operator;
    }

    RuleConditions::try_from(parts).map_err(|err| RepairError::InvalidRuleState(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::NewCategory;
    use crate::groups::{GroupItemType, NewGroup};
    use crate::migrations::run_migrations;
    use crate::rules::{ConditionParts, LogicalOperator, NewRule, Rule};
    use tempfile::TempDir;

    const OWNER: Owner = Owner {
        org_id: 1,
        user_id: 1,
    };

    struct Fixture {
        registry: RepairActionRegistry,
        rules: RuleRepository,
        groups: GroupRepository,
        categories: CategoryRepository,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        Fixture {
            registry: RepairActionRegistry::new(db.clone()),
            rules: RuleRepository::new(db.clone()),
            groups: GroupRepository::new(db.clone()),
            categories: CategoryRepository::new(db),
            _dir: dir,
        }
    }

    async fn receipts_rule(fx: &Fixture) -> Rule {
        let conditions = RuleConditions::try_from(ConditionParts {
            ai_instructions: Some("Receipts from online stores".into()),
            static_conditions: Some(StaticCondition {
                subject: Some("receipt".into()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .expect("conditions");
        fx.rules
            .create(
                OWNER,
                NewRule {
                    name: "Receipts".into(),
                    description: None,
                    conditions,
                },
            )
            .await
            .expect("create rule")
    }

    fn edit(rule_id: &str) -> EditRuleArgs {
        EditRuleArgs {
            rule_id: rule_id.into(),
            name: None,
            ai_instructions: None,
            from: None,
            to: None,
            subject: None,
            body: None,
            conditional_operator: None,
        }
    }

    #[tokio::test]
    async fn edit_rule_replaces_only_supplied_fields() {
        let fx = fixture().await;
        let rule = receipts_rule(&fx).await;

        let mut args = edit(&rule.id);
        args.from = Some(Some("@amazon.com".into()));
        args.subject = Some(None);
        let outcome = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(args))
            .await
            .expect("apply");
        assert_eq!(outcome, ActionOutcome::Applied);

        let updated = fx.rules.get_by_id(OWNER, &rule.id).await.expect("fetch");
        let static_conditions = updated.conditions.static_conditions().expect("static");
        assert_eq!(static_conditions.from.as_deref(), Some("@amazon.com"));
        assert!(static_conditions.subject.is_none());
        assert_eq!(
            updated.conditions.ai().map(|ai| ai.instructions.as_str()),
            Some("Receipts from online stores")
        );
        assert_eq!(updated.name, "Receipts");
    }

    #[tokio::test]
    async fn identical_edit_is_a_no_op() {
        let fx = fixture().await;
        let rule = receipts_rule(&fx).await;

        let mut args = edit(&rule.id);
        args.subject = Some(Some("receipt".into()));
        args.conditional_operator = Some(LogicalOperator::And);
        let outcome = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(args))
            .await
            .expect("apply");
        assert_eq!(outcome, ActionOutcome::Unchanged);

        let fetched = fx.rules.get_by_id(OWNER, &rule.id).await.expect("fetch");
        assert_eq!(fetched.updated_at, rule.updated_at);
    }

    #[tokio::test]
    async fn edit_emptying_an_and_rule_is_rejected_without_a_write() {
        let fx = fixture().await;
        let rule = receipts_rule(&fx).await;

        let mut args = edit(&rule.id);
        args.subject = Some(None);
        args.ai_instructions = Some(Some("".into()));
        args.name = Some("Renamed".into());
        let err = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(args))
            .await
            .expect_err("rejected");
        assert!(matches!(err, RepairError::InvalidRuleState(_)));

        let fetched = fx.rules.get_by_id(OWNER, &rule.id).await.expect("fetch");
        assert_eq!(fetched, rule);
    }

    #[tokio::test]
    async fn edit_rule_validates_identity_and_name() {
        let fx = fixture().await;
        let rule = receipts_rule(&fx).await;
        fx.rules
            .create(
                OWNER,
                NewRule {
                    name: "Invoices".into(),
                    description: None,
                    conditions: rule.conditions.clone(),
                },
            )
            .await
            .expect("second rule");

        let err = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(edit("missing")))
            .await
            .expect_err("missing");
        assert!(matches!(err, RepairError::NotFound(ref what) if what.contains("missing")));

        let mut rename = edit(&rule.id);
        rename.name = Some("Invoices".into());
        let err = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(rename))
            .await
            .expect_err("clash");
        assert!(matches!(err, RepairError::InvalidArguments(_)));

        let mut blank = edit(&rule.id);
        blank.name = Some("  ".into());
        let err = fx
            .registry
            .apply(OWNER, &RepairAction::EditRule(blank))
            .await
            .expect_err("blank name");
        assert!(matches!(err, RepairError::InvalidArguments(_)));

        let err = fx
            .registry
            .apply(Owner::new(2, 2), &RepairAction::EditRule(edit(&rule.id)))
            .await
            .expect_err("foreign owner");
        assert!(matches!(err, RepairError::NotFound(_)));
    }

    #[tokio::test]
    async fn group_actions_are_idempotent() {
        let fx = fixture().await;
        let group = fx
            .groups
            .create(OWNER, NewGroup { name: "Newsletters".into(), prompt: None })
            .await
            .expect("group");
        let item = GroupItemArgs {
            group_id: group.id.clone(),
            item_type: GroupItemType::From,
            value: "@convertkit.com".into(),
        };

        let add = RepairAction::AddToGroup(item.clone());
        assert_eq!(fx.registry.apply(OWNER, &add).await.expect("add"), ActionOutcome::Applied);
        assert_eq!(
            fx.registry.apply(OWNER, &add).await.expect("add again"),
            ActionOutcome::Unchanged
        );
        assert_eq!(fx.groups.get_by_id(OWNER, &group.id).await.expect("group").items.len(), 1);

        let remove = RepairAction::RemoveFromGroup(item);
        assert_eq!(
            fx.registry.apply(OWNER, &remove).await.expect("remove"),
            ActionOutcome::Applied
        );
        assert_eq!(
            fx.registry.apply(OWNER, &remove).await.expect("remove again"),
            ActionOutcome::Unchanged
        );

        let missing = RepairAction::AddToGroup(GroupItemArgs {
            group_id: "nope".into(),
            item_type: GroupItemType::From,
            value: "a@b.com".into(),
        });
        assert!(matches!(
            fx.registry.apply(OWNER, &missing).await,
            Err(RepairError::NotFound(_))
        ));

        let blank = RepairAction::AddToGroup(GroupItemArgs {
            group_id: group.id,
            item_type: GroupItemType::Subject,
            value: " ".into(),
        });
        assert!(matches!(
            fx.registry.apply(OWNER, &blank).await,
            Err(RepairError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_adds_apply_once() {
        let fx = fixture().await;
        let group = fx
            .groups
            .create(OWNER, NewGroup { name: "VIP".into(), prompt: None })
            .await
            .expect("group");
        let action = RepairAction::AddToGroup(GroupItemArgs {
            group_id: group.id.clone(),
            item_type: GroupItemType::From,
            value: "ceo@corp.io".into(),
        });

        let (first, second) = tokio::join!(
            fx.registry.apply(OWNER, &action),
            fx.registry.apply(OWNER, &action)
        );
        let mut outcomes = vec![first.expect("first"), second.expect("second")];
        outcomes.sort_by_key(|outcome| outcome.as_str());
        assert_eq!(outcomes, vec![ActionOutcome::Applied, ActionOutcome::Unchanged]);
    }

    #[tokio::test]
    async fn change_sender_category_is_last_write_wins() {
        let fx = fixture().await;
        for name in ["Marketing", "Sales"] {
            fx.categories
                .create(OWNER, NewCategory { name: name.into(), description: None })
                .await
                .expect("category");
        }

        let change = |category: &str| {
            RepairAction::ChangeSenderCategory(ChangeSenderCategoryArgs {
                sender: "Rep <rep@vendor.com>".into(),
                category_name: category.into(),
            })
        };

        assert_eq!(
            fx.registry.apply(OWNER, &change("marketing")).await.expect("apply"),
            ActionOutcome::Applied
        );
        assert_eq!(
            fx.registry.apply(OWNER, &change("Sales")).await.expect("apply"),
            ActionOutcome::Applied
        );
        assert_eq!(
            fx.registry.apply(OWNER, &change("SALES")).await.expect("apply"),
            ActionOutcome::Unchanged
        );
        let current = fx
            .categories
            .get_sender_category(OWNER, "rep@vendor.com")
            .await
            .expect("lookup");
        assert_eq!(current.map(|c| c.name), Some("Sales".into()));

        assert!(matches!(
            fx.registry.apply(OWNER, &change("Finance")).await,
            Err(RepairError::NotFound(_))
        ));

        let blank_sender = RepairAction::ChangeSenderCategory(ChangeSenderCategoryArgs {
            sender: " ".into(),
            category_name: "Sales".into(),
        });
        assert!(matches!(
            fx.registry.apply(OWNER, &blank_sender).await,
            Err(RepairError::InvalidArguments(_))
        ));
    }
}
