//! The closed set of mutations a diagnosis may request, and their tool schemas.

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::email::normalize_address;
use crate::groups::{GroupItemType, normalize_item_value};
use crate::llm::{Tool, ToolCallResult};
use crate::rules::LogicalOperator;

pub const EDIT_RULE_TOOL: &str = "edit_rule";
pub const ADD_TO_GROUP_TOOL: &str = "add_to_group";
pub const REMOVE_FROM_GROUP_TOOL: &str = "remove_from_group";
pub const CHANGE_SENDER_CATEGORY_TOOL: &str = "change_sender_category";

/// Partial replacement of a rule's definition.
///
/// Omitted fields are kept. A condition field set to `null` (or an empty string)
/// removes that matcher from the rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EditRuleArgs {
    /// Id of the rule to edit.
    pub rule_id: String,
    /// New display name for the rule. Omit to keep the current name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-text instructions judged semantically. Null removes them.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub ai_instructions: Option<Option<String>>,
    /// Sender matcher: `@domain.com`, `domain.com`, or an exact address. Null removes it.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub from: Option<Option<String>>,
    /// Recipient matcher, same syntax as `from`. Null removes it.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub to: Option<Option<String>>,
    /// Case-insensitive subject substring. Null removes it.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub subject: Option<Option<String>>,
    /// Case-insensitive body substring. Null removes it.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub body: Option<Option<String>>,
    /// How the rule's condition groups combine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_operator: Option<LogicalOperator>,
}

/// Group membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GroupItemArgs {
    /// Id of the group to change.
    pub group_id: String,
    /// `from` matches the sender address, `subject` matches the subject line.
    #[serde(rename = "type")]
    pub item_type: GroupItemType,
    /// For `from`: `@domain.com` for a whole domain or a sender address. For
    /// `subject`: a case-insensitive substring.
    pub value: String,
}

/// Reassign the sender's category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeSenderCategoryArgs {
    /// Sender email address.
    pub sender: String,
    /// Name of an existing category.
    pub category_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum RepairAction {
    EditRule(EditRuleArgs),
    AddToGroup(GroupItemArgs),
    RemoveFromGroup(GroupItemArgs),
    ChangeSenderCategory(ChangeSenderCategoryArgs),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

impl RepairAction {
    /// Parse a model tool call into a typed action. Arguments are only checked
    /// for shape here; referential checks happen when the action is applied.
    pub fn from_tool_call(call: &ToolCallResult) -> Result<Self, ToolCallError> {
        let invalid = |err: serde_json::Error| ToolCallError::InvalidArguments {
            tool: call.fn_name.clone(),
            message: err.to_string(),
        };
        let args = call.fn_arguments.clone();

        match call.fn_name.as_str() {
            EDIT_RULE_TOOL => serde_json::from_value(args)
                .map(RepairAction::EditRule)
                .map_err(invalid),
            ADD_TO_GROUP_TOOL => serde_json::from_value(args)
                .map(RepairAction::AddToGroup)
                .map_err(invalid),
            REMOVE_FROM_GROUP_TOOL => serde_json::from_value(args)
                .map(RepairAction::RemoveFromGroup)
                .map_err(invalid),
            CHANGE_SENDER_CATEGORY_TOOL => serde_json::from_value(args)
                .map(RepairAction::ChangeSenderCategory)
                .map_err(invalid),
            other => Err(ToolCallError::UnknownTool(other.to_string())),
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            RepairAction::EditRule(_) => EDIT_RULE_TOOL,
            RepairAction::AddToGroup(_) => ADD_TO_GROUP_TOOL,
            RepairAction::RemoveFromGroup(_) => REMOVE_FROM_GROUP_TOOL,
            RepairAction::ChangeSenderCategory(_) => CHANGE_SENDER_CATEGORY_TOOL,
        }
    }

    /// Identity of the single entity the action touches.
    pub fn target(&self) -> String {
        match self {
            RepairAction::EditRule(args) => format!("rule:{}", args.rule_id),
            RepairAction::AddToGroup(args) | RepairAction::RemoveFromGroup(args) => {
                format!("group:{}", args.group_id)
            }
            RepairAction::ChangeSenderCategory(args) => {
                format!("sender:{}", normalize_address(&args.sender))
            }
        }
    }

    /// Canonical form used to detect repeated proposals within a session.
    pub fn normalized(&self) -> RepairAction {
        match self {
            RepairAction::EditRule(args) => {
                let blank_to_none = |field: &Option<Option<String>>| {
                    field.as_ref().map(|value| {
                        value
                            .as_deref()
                            .map(str::trim)
                            .filter(|value| !value.is_empty())
                            .map(str::to_string)
                    })
                };
                RepairAction::EditRule(EditRuleArgs {
                    rule_id: args.rule_id.trim().to_string(),
                    name: args.name.as_deref().map(|name| name.trim().to_string()),
                    ai_instructions: blank_to_none(&args.ai_instructions),
                    from: blank_to_none(&args.from),
                    to: blank_to_none(&args.to),
                    subject: blank_to_none(&args.subject),
                    body: blank_to_none(&args.body),
                    conditional_operator: args.conditional_operator,
                })
            }
            RepairAction::AddToGroup(args) => RepairAction::AddToGroup(normalize_item(args)),
            RepairAction::RemoveFromGroup(args) => {
                RepairAction::RemoveFromGroup(normalize_item(args))
            }
            RepairAction::ChangeSenderCategory(args) => {
                RepairAction::ChangeSenderCategory(ChangeSenderCategoryArgs {
                    sender: normalize_address(&args.sender),
                    category_name: args.category_name.trim().to_lowercase(),
                })
            }
        }
    }

    pub fn same_as(&self, other: &RepairAction) -> bool {
        self.normalized() == other.normalized()
    }
}

fn normalize_item(args: &GroupItemArgs) -> GroupItemArgs {
    GroupItemArgs {
        group_id: args.group_id.trim().to_string(),
        item_type: args.item_type,
        value: normalize_item_value(&args.value),
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn schema_tool<T: JsonSchema>(name: &str, description: &str) -> Tool {
    let schema = schema_for!(T);
    let schema_value = serde_json::to_value(schema).expect("schema should serialize");
    Tool::new(name)
        .with_description(description)
        .with_schema(schema_value)
}

/// Tool definitions offered to the reasoning service, one per action.
pub fn repair_tools() -> Vec<Tool> {
    vec![
        schema_tool::<EditRuleArgs>(
            EDIT_RULE_TOOL,
            "Change a rule's name, AI instructions, static matchers (from, to, subject, body) \
             or logical operator. Only supplied fields change; null removes a matcher.",
        ),
        schema_tool::<GroupItemArgs>(
            ADD_TO_GROUP_TOOL,
            "Add a sender pattern or subject phrase to a group. Prefer `@domain.com` when \
             every sender of the domain belongs in the group.",
        ),
        schema_tool::<GroupItemArgs>(
            REMOVE_FROM_GROUP_TOOL,
            "Remove an existing item from a group. The value must match the stored item.",
        ),
        schema_tool::<ChangeSenderCategoryArgs>(
            CHANGE_SENDER_CATEGORY_TOOL,
            "Assign the sender to a different existing category.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCallResult {
        ToolCallResult {
            call_id: "call-1".into(),
            fn_name: name.into(),
            fn_arguments: arguments,
        }
    }

    #[test]
    fn edit_rule_distinguishes_missing_null_and_value() {
        let action = RepairAction::from_tool_call(&call(
            EDIT_RULE_TOOL,
            json!({
                "rule_id": "rule-1",
                "subject": null,
                "from": "@amazon.com",
                "conditional_operator": "OR"
            }),
        ))
        .expect("parse");

        let RepairAction::EditRule(args) = action else {
            panic!("expected edit_rule");
        };
        assert_eq!(args.subject, Some(None));
        assert_eq!(args.from, Some(Some("@amazon.com".into())));
        assert_eq!(args.body, None);
        assert_eq!(args.ai_instructions, None);
        assert_eq!(args.conditional_operator, Some(LogicalOperator::Or));
    }

    #[test]
    fn group_actions_accept_uppercase_item_types() {
        let action = RepairAction::from_tool_call(&call(
            REMOVE_FROM_GROUP_TOOL,
            json!({"group_id": "g1", "type": "FROM", "value": "david@hello.com"}),
        ))
        .expect("parse");
        assert_eq!(
            action,
            RepairAction::RemoveFromGroup(GroupItemArgs {
                group_id: "g1".into(),
                item_type: GroupItemType::From,
                value: "david@hello.com".into(),
            })
        );
        assert_eq!(action.target(), "group:g1");
    }

    #[test]
    fn unknown_tools_and_bad_arguments_are_rejected() {
        assert_eq!(
            RepairAction::from_tool_call(&call("delete_rule", json!({}))),
            Err(ToolCallError::UnknownTool("delete_rule".into()))
        );

        let err = RepairAction::from_tool_call(&call(
            ADD_TO_GROUP_TOOL,
            json!({"group_id": "g1", "type": "cc", "value": "x"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidArguments { ref tool, .. } if tool == ADD_TO_GROUP_TOOL));

        let err = RepairAction::from_tool_call(&call(
            CHANGE_SENDER_CATEGORY_TOOL,
            json!({"sender": "a@b.com"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidArguments { .. }));
    }

    #[test]
    fn same_as_ignores_case_and_whitespace() {
        let a = RepairAction::AddToGroup(GroupItemArgs {
            group_id: "g1".into(),
            item_type: GroupItemType::From,
            value: "@ConvertKit.com".into(),
        });
        let b = RepairAction::AddToGroup(GroupItemArgs {
            group_id: "g1".into(),
            item_type: GroupItemType::From,
            value: " @convertkit.com ".into(),
        });
        let remove = RepairAction::RemoveFromGroup(GroupItemArgs {
            group_id: "g1".into(),
            item_type: GroupItemType::From,
            value: "@convertkit.com".into(),
        });
        assert!(a.same_as(&b));
        assert!(!a.same_as(&remove));

        let blank = RepairAction::EditRule(EditRuleArgs {
            rule_id: "r".into(),
            name: None,
            ai_instructions: None,
            from: None,
            to: None,
            subject: Some(Some("  ".into())),
            body: None,
            conditional_operator: None,
        });
        let null = RepairAction::EditRule(EditRuleArgs {
            subject: Some(None),
            ..match blank.clone() {
                RepairAction::EditRule(args) => args,
                _ => unreachable!(),
            }
        });
        assert!(blank.same_as(&null));
    }

    #[test]
    fn tools_cover_the_whole_vocabulary() {
        let tools = repair_tools();
        let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                EDIT_RULE_TOOL,
                ADD_TO_GROUP_TOOL,
                REMOVE_FROM_GROUP_TOOL,
                CHANGE_SENDER_CATEGORY_TOOL
            ]
        );

        let schema = tools[1].schema.as_ref().expect("schema");
        let properties = &schema["properties"];
        assert!(properties.get("group_id").is_some());
        assert!(properties.get("type").is_some());
        assert!(properties.get("value").is_some());

        let edit_schema = tools[0].schema.as_ref().expect("schema");
        assert!(edit_schema["properties"].get("subject").is_some());
        assert!(edit_schema["properties"].get("conditional_operator").is_some());
    }

    #[test]
    fn actions_serialize_with_tag_and_arguments() {
        let action = RepairAction::ChangeSenderCategory(ChangeSenderCategoryArgs {
            sender: "rep@vendor.com".into(),
            category_name: "Sales".into(),
        });
        assert_eq!(
            serde_json::to_value(&action).expect("serialize"),
            json!({
                "action": "change_sender_category",
                "arguments": {"sender": "rep@vendor.com", "category_name": "Sales"}
            })
        );
    }
}
