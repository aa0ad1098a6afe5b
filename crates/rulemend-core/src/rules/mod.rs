pub mod conditions;
pub mod evaluator;
pub mod repositories;
pub mod types;

pub use conditions::{
    AiCondition, CategoryCondition, CategoryFilterType, ConditionError, ConditionGroup,
    ConditionKind, ConditionParts, GroupCondition, LogicalOperator, RuleConditions,
    StaticCondition, parse_conditions,
};
pub use evaluator::{
    ConditionOutcome, ConditionVerdict, EvaluationContext, MatchResult, Verdict, evaluate,
};
pub use repositories::{RuleError, RuleRepository};
pub use types::{NewRule, Rule};
