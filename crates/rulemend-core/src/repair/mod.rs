//! Typed repair actions proposed by the reasoning service and the registry
//! that validates and applies them.

pub mod actions;
pub mod registry;

pub use actions::{
    ADD_TO_GROUP_TOOL, CHANGE_SENDER_CATEGORY_TOOL, ChangeSenderCategoryArgs, EDIT_RULE_TOOL,
    EditRuleArgs, GroupItemArgs, REMOVE_FROM_GROUP_TOOL, RepairAction, ToolCallError,
    repair_tools,
};
pub use registry::{ActionOutcome, RepairActionRegistry, RepairError};
