//! Query language and result shapes
//!
//! Queries are JSON maps of attribute path → predicate. A predicate is either
//! a literal (equality, with array-contains semantics for array attributes)
//! or an operator object: `$in`, `$nin`, `$ne`, `$exists`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$like`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::doc::Doc;
use super::Ref;

pub type DocumentQuery = Map<String, Value>;

/// Ascending = 1, descending = -1
pub type SortingOrder = i32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<BTreeMap<String, SortingOrder>>,
    /// attribute → class of the referenced document, joined into `$lookup`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<BTreeMap<String, Ref>>,
    /// Compute the full match count even when `limit` truncates
    #[serde(default)]
    pub total: bool,
}

/// Query result annotated with a total count and an optional lookup map.
///
/// Serialized as `{dataType: "TotalArray", total, lookupMap, value}`; see
/// `codec` for the wire impls.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult<T> {
    pub value: Vec<T>,
    /// Total number of matches, `-1` when not computed
    pub total: i64,
    pub lookup_map: Option<Map<String, Value>>,
}

impl<T> FindResult<T> {
    pub fn new(value: Vec<T>, total: i64) -> Self {
        Self {
            value,
            total,
            lookup_map: None,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl<T> Default for FindResult<T> {
    fn default() -> Self {
        Self::new(Vec::new(), 0)
    }
}

/// Result of a domain request, tagged with the domain that answered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult<T> {
    pub domain: String,
    pub value: T,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<Ref>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spaces: Option<Vec<Ref>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultDoc {
    #[serde(rename = "_id")]
    pub id: Ref,
    #[serde(rename = "_class")]
    pub class: Ref,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub docs: Vec<SearchResultDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

/// Identity and content hash of a stored document (backup chunks)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocInfo {
    pub id: Ref,
    pub hash: String,
    pub size: usize,
}

/// Check a document against a query.
pub fn matches_query(doc: &Doc, query: &DocumentQuery) -> bool {
    query.iter().all(|(path, predicate)| {
        let actual = doc.get(path);
        match predicate {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, arg)| match_operator(actual, op, arg))
            }
            expected => match actual {
                Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
                Some(actual) => actual == expected,
                None => expected.is_null(),
            },
        }
    })
}

fn match_operator(actual: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$in" => arg
            .as_array()
            .map(|set| actual.map_or(false, |a| set.contains(a)))
            .unwrap_or(false),
        "$nin" => arg
            .as_array()
            .map(|set| actual.map_or(true, |a| !set.contains(a)))
            .unwrap_or(true),
        "$ne" => actual != Some(arg),
        "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
        "$gt" => compare(actual, arg) == Some(Ordering::Greater),
        "$gte" => matches!(compare(actual, arg), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(actual, arg) == Some(Ordering::Less),
        "$lte" => matches!(compare(actual, arg), Some(Ordering::Less | Ordering::Equal)),
        "$like" => match (actual.and_then(Value::as_str), arg.as_str()) {
            (Some(value), Some(pattern)) => like(value, pattern),
            _ => false,
        },
        _ => false,
    }
}

fn compare(actual: Option<&Value>, arg: &Value) -> Option<Ordering> {
    match (actual?, arg) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// SQL-ish `%` wildcard match, case-insensitive
fn like(value: &str, pattern: &str) -> bool {
    let value = value.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }

    let mut rest = value.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

/// Compare two documents under a sort specification.
pub fn compare_docs(a: &Doc, b: &Doc, sort: &BTreeMap<String, SortingOrder>) -> Ordering {
    for (path, order) in sort {
        let ord = compare_values(a.get(path), b.get(path));
        let ord = if *order < 0 { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(Some(a), b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
    }
}
