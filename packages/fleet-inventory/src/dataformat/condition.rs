//! Partition condition expressions.
//!
//! A leaf partition classifies block replicas with a small predicate over the
//! replica's owning group, completeness flags, and the dataset name. The text
//! form comes from the server configuration.

use serde::{Deserialize, Serialize};

use crate::error::ObjectError;
use crate::glob::glob_match;

/// Attribute view of one block replica, as seen by a condition.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaContext<'a> {
    pub dataset: &'a str,
    pub group: Option<&'a str>,
    pub is_custodial: bool,
    pub is_complete: bool,
}

/// Predicate over a block replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicaCondition {
    /// Matches every replica
    Always,
    /// Owning group equals the given name; `None` matches unowned replicas
    GroupIs(Option<String>),
    IsCustodial(bool),
    IsComplete(bool),
    /// Dataset name matches a glob pattern
    DatasetMatches(String),
    Not(Box<ReplicaCondition>),
    All(Vec<ReplicaCondition>),
    Any(Vec<ReplicaCondition>),
}

impl ReplicaCondition {
    pub fn matches(&self, ctx: &ReplicaContext<'_>) -> bool {
        match self {
            ReplicaCondition::Always => true,
            ReplicaCondition::GroupIs(name) => ctx.group == name.as_deref(),
            ReplicaCondition::IsCustodial(want) => ctx.is_custodial == *want,
            ReplicaCondition::IsComplete(want) => ctx.is_complete == *want,
            ReplicaCondition::DatasetMatches(pattern) => glob_match(pattern, ctx.dataset),
            ReplicaCondition::Not(inner) => !inner.matches(ctx),
            ReplicaCondition::All(parts) => parts.iter().all(|c| c.matches(ctx)),
            ReplicaCondition::Any(parts) => parts.iter().any(|c| c.matches(ctx)),
        }
    }

    /// Parses the configuration text form.
    ///
    /// Grammar: terms joined by ` and ` or ` or ` (one connective kind per
    /// expression). Terms: `true`, `is_custodial`, `is_complete`,
    /// `group == <name>`, `group == unowned`, `dataset == <glob>`, each
    /// optionally prefixed with `not `.
    pub fn parse(text: &str) -> Result<Self, ObjectError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(invalid(text, "empty expression"));
        }

        let has_and = text.contains(" and ");
        let has_or = text.contains(" or ");
        if has_and && has_or {
            return Err(invalid(text, "mixed 'and'/'or' without grouping"));
        }

        let parts: Vec<&str> = if has_and {
            text.split(" and ").collect()
        } else if has_or {
            text.split(" or ").collect()
        } else {
            vec![text]
        };

        let mut terms = Vec::with_capacity(parts.len());
        for part in parts {
            terms.push(Self::parse_term(part.trim(), text)?);
        }

        if terms.len() == 1 {
            Ok(terms.pop().expect("one term"))
        } else if has_and {
            Ok(ReplicaCondition::All(terms))
        } else {
            Ok(ReplicaCondition::Any(terms))
        }
    }

    fn parse_term(term: &str, full: &str) -> Result<Self, ObjectError> {
        if let Some(rest) = term.strip_prefix("not ") {
            return Ok(ReplicaCondition::Not(Box::new(Self::parse_term(
                rest.trim(),
                full,
            )?)));
        }

        match term {
            "true" => return Ok(ReplicaCondition::Always),
            "is_custodial" => return Ok(ReplicaCondition::IsCustodial(true)),
            "is_complete" => return Ok(ReplicaCondition::IsComplete(true)),
            _ => {}
        }

        if let Some((lhs, rhs)) = term.split_once("==") {
            let lhs = lhs.trim();
            let rhs = rhs.trim();
            if rhs.is_empty() {
                return Err(invalid(full, "missing right-hand side"));
            }
            return match lhs {
                "group" => {
                    if rhs == "unowned" {
                        Ok(ReplicaCondition::GroupIs(None))
                    } else {
                        Ok(ReplicaCondition::GroupIs(Some(rhs.to_owned())))
                    }
                }
                "dataset" => Ok(ReplicaCondition::DatasetMatches(rhs.to_owned())),
                _ => Err(invalid(full, &format!("unknown attribute '{}'", lhs))),
            };
        }

        Err(invalid(full, &format!("unrecognized term '{}'", term)))
    }
}

fn invalid(text: &str, reason: &str) -> ObjectError {
    ObjectError::InvalidCondition {
        text: text.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(dataset: &'a str, group: Option<&'a str>) -> ReplicaContext<'a> {
        ReplicaContext {
            dataset,
            group,
            is_custodial: false,
            is_complete: true,
        }
    }

    #[test]
    fn parses_group_term() {
        let cond = ReplicaCondition::parse("group == analysis").unwrap();
        assert!(cond.matches(&ctx("/a/b", Some("analysis"))));
        assert!(!cond.matches(&ctx("/a/b", Some("prod"))));
        assert!(!cond.matches(&ctx("/a/b", None)));
    }

    #[test]
    fn parses_unowned_and_negation() {
        let cond = ReplicaCondition::parse("not group == unowned").unwrap();
        assert!(cond.matches(&ctx("/a/b", Some("prod"))));
        assert!(!cond.matches(&ctx("/a/b", None)));
    }

    #[test]
    fn parses_conjunction() {
        let cond = ReplicaCondition::parse("group == prod and dataset == /store/*").unwrap();
        assert!(cond.matches(&ctx("/store/run1", Some("prod"))));
        assert!(!cond.matches(&ctx("/user/run1", Some("prod"))));
    }

    #[test]
    fn rejects_mixed_connectives() {
        assert!(ReplicaCondition::parse("true and true or true").is_err());
    }
}
