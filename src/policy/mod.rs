//! 策略层：受限表达式、规则文档与规则求值

pub mod engine;
pub mod expr;
pub mod rule;

pub use engine::{evaluate, ConfirmationStatus, ConstraintContext, ConstraintResult, RuleFailure};
pub use expr::{Expr, ExprError, Transform};
pub use rule::{ConstraintRule, PolicyDocument, PolicySettings, PolicyStore, RuleAction, RuleConfig};
