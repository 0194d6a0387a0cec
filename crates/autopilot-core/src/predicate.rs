//! JSON predicates — a small compositional matching DSL over [`JsonValue`].
//!
//! ```text
//! JsonPredicate
//!   ├── Matcher(JsonMatcher)      path + ValueMatcher
//!   ├── And([p, ...])             all children match (≥1 child)
//!   ├── Or([p, ...])              any child matches (≥1 child)
//!   └── Not(p)                    exactly one child
//! ```
//!
//! Every constructor validates its shape, so a built predicate is always
//! well-formed. `parse(serialize(p))` is behaviorally equivalent to `p`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AutopilotError, Result};
use crate::json::JsonValue;
use crate::version::VersionConstraint;

const AND_KEY: &str = "and";
const OR_KEY: &str = "or";
const NOT_KEY: &str = "not";
const KEY_KEY: &str = "key";
const SCOPE_KEY: &str = "scope";
const IGNORE_CASE_KEY: &str = "ignore_case";
const VALUE_KEY: &str = "value";
const EQUALS_KEY: &str = "equals";
const AT_LEAST_KEY: &str = "at_least";
const AT_MOST_KEY: &str = "at_most";
const IS_PRESENT_KEY: &str = "is_present";
const VERSION_MATCHES_KEY: &str = "version_matches";
const VERSION_KEY: &str = "version";
const ARRAY_CONTAINS_KEY: &str = "array_contains";
const INDEX_KEY: &str = "index";

/// A boolean test over a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPredicate(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Matcher(JsonMatcher),
    And(Vec<JsonPredicate>),
    Or(Vec<JsonPredicate>),
    Not(Box<JsonPredicate>),
}

impl JsonPredicate {
    /// Leaf predicate.
    pub fn matcher(matcher: JsonMatcher) -> Self {
        Self(Node::Matcher(matcher))
    }

    /// Conjunction. Fails on zero children.
    pub fn and(children: Vec<JsonPredicate>) -> Result<Self> {
        if children.is_empty() {
            return Err(AutopilotError::construction("AND predicate requires at least one child"));
        }
        Ok(Self(Node::And(children)))
    }

    /// Disjunction. Fails on zero children.
    pub fn or(children: Vec<JsonPredicate>) -> Result<Self> {
        if children.is_empty() {
            return Err(AutopilotError::construction("OR predicate requires at least one child"));
        }
        Ok(Self(Node::Or(children)))
    }

    /// Negation built from a child list. Fails unless there is exactly one.
    pub fn not(children: Vec<JsonPredicate>) -> Result<Self> {
        let count = children.len();
        let mut iter = children.into_iter();
        match (iter.next(), count) {
            (Some(child), 1) => Ok(Self::negate(child)),
            _ => Err(AutopilotError::construction(format!(
                "NOT predicate requires exactly one child, got {count}"
            ))),
        }
    }

    /// Negation of a single predicate.
    pub fn negate(child: JsonPredicate) -> Self {
        Self(Node::Not(Box::new(child)))
    }

    /// Evaluate against a value.
    pub fn apply(&self, value: &JsonValue) -> bool {
        match &self.0 {
            Node::Matcher(m) => m.apply(value),
            Node::And(children) => children.iter().all(|p| p.apply(value)),
            Node::Or(children) => children.iter().any(|p| p.apply(value)),
            Node::Not(child) => !child.apply(value),
        }
    }

    /// Parse from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_json(&JsonValue::parse(text)?)
    }

    /// Build from a JSON value.
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let Some(obj) = json.as_object() else {
            return Err(AutopilotError::parse(format!(
                "predicate must be an object, got {}",
                json.type_name()
            )));
        };

        if let Some(children) = obj.get(AND_KEY) {
            return Self::and(parse_children(AND_KEY, children)?);
        }
        if let Some(children) = obj.get(OR_KEY) {
            return Self::or(parse_children(OR_KEY, children)?);
        }
        if let Some(child) = obj.get(NOT_KEY) {
            return match child {
                JsonValue::Array(_) => Self::not(parse_children(NOT_KEY, child)?),
                _ => Ok(Self::negate(Self::from_json(child)?)),
            };
        }

        JsonMatcher::from_json(json).map(Self::matcher)
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match &self.0 {
            Node::Matcher(m) => m.to_json(),
            Node::And(children) => JsonValue::object([(
                AND_KEY,
                JsonValue::Array(children.iter().map(Self::to_json).collect()),
            )]),
            Node::Or(children) => JsonValue::object([(
                OR_KEY,
                JsonValue::Array(children.iter().map(Self::to_json).collect()),
            )]),
            Node::Not(child) => JsonValue::object([(NOT_KEY, child.to_json())]),
        }
    }
}

fn parse_children(key: &str, value: &JsonValue) -> Result<Vec<JsonPredicate>> {
    let Some(items) = value.as_array() else {
        return Err(AutopilotError::parse(format!(
            "'{key}' must be an array of predicates, got {}",
            value.type_name()
        )));
    };
    items.iter().map(JsonPredicate::from_json).collect()
}

impl Serialize for JsonPredicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonPredicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Self::from_json(&json).map_err(serde::de::Error::custom)
    }
}

/// Leaf matcher: resolve a field path, then test the value found there.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMatcher {
    path: Vec<String>,
    ignore_case: bool,
    value: ValueMatcher,
}

impl JsonMatcher {
    /// Matcher applied to the root value.
    pub fn new(value: ValueMatcher) -> Self {
        Self {
            path: Vec::new(),
            ignore_case: false,
            value,
        }
    }

    /// Descend through these object keys before matching.
    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    /// Shorthand for a single-key path.
    pub fn with_key(self, key: impl Into<String>) -> Self {
        self.with_path([key.into()])
    }

    pub fn ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn apply(&self, value: &JsonValue) -> bool {
        self.value.apply(value.get_path(&self.path), self.ignore_case)
    }

    fn from_json(json: &JsonValue) -> Result<Self> {
        // A bare value matcher object is a leaf with no path.
        let Some(value_json) = json.get(VALUE_KEY) else {
            if let Some(key) = [SCOPE_KEY, KEY_KEY, IGNORE_CASE_KEY]
                .into_iter()
                .find(|key| json.get(key).is_some())
            {
                return Err(AutopilotError::parse(format!(
                    "'{key}' requires a '{VALUE_KEY}' matcher"
                )));
            }
            return ValueMatcher::from_json(json).map(Self::new);
        };

        let mut path = match json.get(SCOPE_KEY) {
            None => Vec::new(),
            Some(JsonValue::String(s)) => vec![s.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        AutopilotError::parse("'scope' entries must be strings")
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(AutopilotError::parse(format!(
                    "'scope' must be a string or array, got {}",
                    other.type_name()
                )));
            }
        };
        match json.get(KEY_KEY) {
            None => {}
            Some(JsonValue::String(key)) => path.push(key.clone()),
            Some(other) => {
                return Err(AutopilotError::parse(format!(
                    "'key' must be a string, got {}",
                    other.type_name()
                )));
            }
        }
        let ignore_case = match json.get(IGNORE_CASE_KEY) {
            None => false,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| AutopilotError::parse("'ignore_case' must be a bool"))?,
        };

        Ok(Self {
            path,
            ignore_case,
            value: ValueMatcher::from_json(value_json)?,
        })
    }

    fn to_json(&self) -> JsonValue {
        let mut fields: Vec<(&str, JsonValue)> = Vec::new();
        if let Some((key, scope)) = self.path.split_last() {
            if !scope.is_empty() {
                fields.push((
                    SCOPE_KEY,
                    JsonValue::Array(scope.iter().map(|s| JsonValue::from(s.as_str())).collect()),
                ));
            }
            fields.push((KEY_KEY, JsonValue::from(key.as_str())));
        }
        if self.ignore_case {
            fields.push((IGNORE_CASE_KEY, JsonValue::Bool(true)));
        }
        fields.push((VALUE_KEY, self.value.to_json()));
        JsonValue::object(fields)
    }
}

/// Test applied to the value a [`JsonMatcher`] resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMatcher(ValueKind);

#[derive(Debug, Clone, PartialEq)]
enum ValueKind {
    Equals(JsonValue),
    Range { min: Option<f64>, max: Option<f64> },
    Presence(bool),
    Version(VersionConstraint),
    ArrayContains {
        predicate: Box<JsonPredicate>,
        index: Option<usize>,
    },
}

impl ValueMatcher {
    pub fn equals(value: impl Into<JsonValue>) -> Self {
        Self(ValueKind::Equals(value.into()))
    }

    /// Numeric range, either bound optional. Fails when `min > max`.
    pub fn range(min: Option<f64>, max: Option<f64>) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (min, max)
            && lo > hi
        {
            return Err(AutopilotError::construction(format!(
                "range minimum {lo} exceeds maximum {hi}"
            )));
        }
        Ok(Self(ValueKind::Range { min, max }))
    }

    pub fn present(present: bool) -> Self {
        Self(ValueKind::Presence(present))
    }

    /// Version constraint, parsed once here.
    pub fn version(constraint: &str) -> Result<Self> {
        Ok(Self(ValueKind::Version(VersionConstraint::parse(constraint)?)))
    }

    pub fn array_contains(predicate: JsonPredicate, index: Option<usize>) -> Self {
        Self(ValueKind::ArrayContains {
            predicate: Box::new(predicate),
            index,
        })
    }

    pub fn apply(&self, value: &JsonValue, ignore_case: bool) -> bool {
        match &self.0 {
            ValueKind::Equals(expected) => {
                if ignore_case {
                    expected.eq_ignore_case(value)
                } else {
                    expected == value
                }
            }
            ValueKind::Range { min, max } => {
                let Some(n) = value.as_f64() else {
                    return false;
                };
                min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
            }
            ValueKind::Presence(present) => !value.is_null() == *present,
            ValueKind::Version(constraint) => {
                value.as_str().is_some_and(|v| constraint.matches(v))
            }
            ValueKind::ArrayContains { predicate, index } => {
                let Some(items) = value.as_array() else {
                    return false;
                };
                match index {
                    Some(i) => items.get(*i).is_some_and(|item| predicate.apply(item)),
                    None => items.iter().any(|item| predicate.apply(item)),
                }
            }
        }
    }

    fn from_json(json: &JsonValue) -> Result<Self> {
        if json.as_object().is_none() {
            return Err(AutopilotError::parse(format!(
                "value matcher must be an object, got {}",
                json.type_name()
            )));
        }

        let kinds: Vec<&str> = [
            (EQUALS_KEY, json.get(EQUALS_KEY).is_some()),
            (
                AT_LEAST_KEY,
                json.get(AT_LEAST_KEY).is_some() || json.get(AT_MOST_KEY).is_some(),
            ),
            (IS_PRESENT_KEY, json.get(IS_PRESENT_KEY).is_some()),
            (
                VERSION_MATCHES_KEY,
                json.get(VERSION_MATCHES_KEY).is_some() || json.get(VERSION_KEY).is_some(),
            ),
            (ARRAY_CONTAINS_KEY, json.get(ARRAY_CONTAINS_KEY).is_some()),
        ]
        .into_iter()
        .filter_map(|(key, present)| present.then_some(key))
        .collect();
        if kinds.len() > 1 {
            return Err(AutopilotError::parse(format!(
                "value matcher mixes {}",
                kinds.join(" and ")
            )));
        }

        if let Some(expected) = json.get(EQUALS_KEY) {
            return Ok(Self::equals(expected.clone()));
        }

        let at_least = json.get(AT_LEAST_KEY);
        let at_most = json.get(AT_MOST_KEY);
        if at_least.is_some() || at_most.is_some() {
            let bound = |key: &str, v: Option<&JsonValue>| -> Result<Option<f64>> {
                match v {
                    None | Some(JsonValue::Null) => Ok(None),
                    Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                        AutopilotError::parse(format!("'{key}' must be a number"))
                    }),
                }
            };
            return Self::range(bound(AT_LEAST_KEY, at_least)?, bound(AT_MOST_KEY, at_most)?);
        }

        if let Some(present) = json.get(IS_PRESENT_KEY) {
            let present = present
                .as_bool()
                .ok_or_else(|| AutopilotError::parse("'is_present' must be a bool"))?;
            return Ok(Self::present(present));
        }

        if let Some(constraint) = json.get(VERSION_MATCHES_KEY).or_else(|| json.get(VERSION_KEY)) {
            let constraint = constraint
                .as_str()
                .ok_or_else(|| AutopilotError::parse("version constraint must be a string"))?;
            return Self::version(constraint);
        }

        if let Some(nested) = json.get(ARRAY_CONTAINS_KEY) {
            let index = match json.get(INDEX_KEY) {
                None => None,
                Some(JsonValue::Number(n)) => Some(
                    n.as_u64()
                        .and_then(|i| usize::try_from(i).ok())
                        .ok_or_else(|| AutopilotError::parse("'index' must be a non-negative integer"))?,
                ),
                Some(_) => return Err(AutopilotError::parse("'index' must be a non-negative integer")),
            };
            return Ok(Self::array_contains(JsonPredicate::from_json(nested)?, index));
        }

        Err(AutopilotError::parse(format!("unknown value matcher: {json}")))
    }

    fn to_json(&self) -> JsonValue {
        match &self.0 {
            ValueKind::Equals(v) => JsonValue::object([(EQUALS_KEY, v.clone())]),
            ValueKind::Range { min, max } => {
                let mut fields = Vec::new();
                if let Some(lo) = min {
                    fields.push((AT_LEAST_KEY, JsonValue::from(*lo)));
                }
                if let Some(hi) = max {
                    fields.push((AT_MOST_KEY, JsonValue::from(*hi)));
                }
                if fields.is_empty() {
                    // Unbounded range still needs a recognizable key.
                    fields.push((AT_LEAST_KEY, JsonValue::Null));
                }
                JsonValue::object(fields)
            }
            ValueKind::Presence(p) => JsonValue::object([(IS_PRESENT_KEY, JsonValue::Bool(*p))]),
            ValueKind::Version(c) => {
                JsonValue::object([(VERSION_MATCHES_KEY, JsonValue::from(c.as_str()))])
            }
            ValueKind::ArrayContains { predicate, index } => {
                let mut fields = vec![(ARRAY_CONTAINS_KEY, predicate.to_json())];
                if let Some(i) = index {
                    fields.push((INDEX_KEY, JsonValue::from(*i as u64)));
                }
                JsonValue::object(fields)
            }
        }
    }
}
