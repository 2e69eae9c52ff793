//! Structural predicates over entity documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structural predicate evaluated against entity documents.
///
/// Where-clauses power `find`: the store returns every entity in a
/// collection whose document matches. Field references are dot-separated
/// paths, resolved the same way patch paths are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "where", rename_all = "snake_case")]
pub enum WhereClause {
    /// Matches every entity.
    All,
    /// Matches when the value at `field` equals `value`.
    Eq {
        /// Dot-separated field path.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Matches when every inner clause matches.
    And {
        /// Inner clauses.
        clauses: Vec<WhereClause>,
    },
    /// Matches when any inner clause matches.
    Or {
        /// Inner clauses.
        clauses: Vec<WhereClause>,
    },
    /// Matches when the inner clause does not.
    Not {
        /// Negated clause.
        clause: Box<WhereClause>,
    },
}

impl WhereClause {
    /// Builds an equality clause.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            field: field.into(),
            value,
        }
    }

    /// Evaluates this clause against an entity document.
    pub fn matches(&self, entity: &Value) -> bool {
        match self {
            WhereClause::All => true,
            WhereClause::Eq { field, value } => resolve(entity, field) == Some(value),
            WhereClause::And { clauses } => clauses.iter().all(|c| c.matches(entity)),
            WhereClause::Or { clauses } => clauses.iter().any(|c| c.matches(entity)),
            WhereClause::Not { clause } => !clause.matches(entity),
        }
    }
}

impl Default for WhereClause {
    fn default() -> Self {
        Self::All
    }
}

fn resolve<'a>(entity: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = entity;
    for segment in field.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
