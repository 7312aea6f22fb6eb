//! State schema and reducers
//!
//! A [`StateSchema`] declares every field of the shared run state together with
//! a semantic type and a [`Reducer`]. Node bodies never write state directly:
//! they return partial updates, and the scheduler folds those updates into the
//! state field by field.
//!
//! ```text
//! old value ──┐
//!             ├──> reducer ──> type check ──> new value
//! partial  ───┘
//! ```
//!
//! # Merge order
//!
//! When several sibling nodes complete in the same BSP round their updates are
//! merged one after another in ascending node-id order. Reducers therefore only
//! need to be deterministic; they do not need to be commutative.
//!
//! # Built-in reducers
//!
//! | Reducer       | Empty old value | Behaviour                                   |
//! |---------------|-----------------|---------------------------------------------|
//! | `Overwrite`   | -               | partial replaces old                        |
//! | `Append`      | `[]`            | arrays are concatenated, scalars are pushed |
//! | `Sum`         | `0`             | numeric addition (integers stay integers)   |
//! | `MergeObject` | `{}`            | shallow object merge, partial keys win      |
//! | `Custom`      | `null`          | user function `(old, partial) -> merged`    |
//!
//! # Example
//!
//! ```rust
//! use stepgraph_core::schema::{FieldType, Reducer, StateSchema};
//!
//! let schema = StateSchema::new()
//!     .field("question", FieldType::String)
//!     .field_with_reducer("log", FieldType::Array, Reducer::Append)
//!     .field_with_reducer("tokens", FieldType::Integer, Reducer::Sum);
//!
//! assert!(schema.contains("log"));
//! ```

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// User-supplied reducer: `(old, partial) -> merged`
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Semantic type of a state field
///
/// `null` is accepted by every type so fields can be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Bool,
    Array,
    Object,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// How a partial value is folded into the existing field value
#[derive(Clone, Default)]
pub enum Reducer {
    #[default]
    Overwrite,
    Append,
    Sum,
    MergeObject,
    Custom(ReducerFn),
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Overwrite => write!(f, "Overwrite"),
            Reducer::Append => write!(f, "Append"),
            Reducer::Sum => write!(f, "Sum"),
            Reducer::MergeObject => write!(f, "MergeObject"),
            Reducer::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

impl Reducer {
    /// Wrap a closure as a custom reducer
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Reducer::Custom(Arc::new(f))
    }

    /// Fold `partial` into `old` for the named field
    pub fn apply(&self, field: &str, old: Option<Value>, partial: Value) -> Result<Value> {
        match self {
            Reducer::Overwrite => Ok(partial),
            Reducer::Append => {
                let mut items = match old {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(GraphError::state(
                            Some(field),
                            format!("append reducer needs an array, found {}", type_name(&other)),
                        ))
                    }
                };
                match partial {
                    Value::Array(more) => items.extend(more),
                    Value::Null => {}
                    scalar => items.push(scalar),
                }
                Ok(Value::Array(items))
            }
            Reducer::Sum => {
                let old = old.unwrap_or(Value::Null);
                sum(field, &old, &partial)
            }
            Reducer::MergeObject => {
                let mut merged = match old {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        return Err(GraphError::state(
                            Some(field),
                            format!("merge reducer needs an object, found {}", type_name(&other)),
                        ))
                    }
                };
                match partial {
                    Value::Object(more) => merged.extend(more),
                    Value::Null => {}
                    other => {
                        return Err(GraphError::state(
                            Some(field),
                            format!("cannot merge {} into an object", type_name(&other)),
                        ))
                    }
                }
                Ok(Value::Object(merged))
            }
            Reducer::Custom(f) => Ok(f(old.unwrap_or(Value::Null), partial)),
        }
    }
}

fn sum(field: &str, old: &Value, partial: &Value) -> Result<Value> {
    let zero = Value::from(0);
    let old = if old.is_null() { &zero } else { old };
    if partial.is_null() {
        return Ok(old.clone());
    }

    match (old, partial) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(total) = a.checked_add(b) {
                    return Ok(Value::from(total));
                }
            }
            let total = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
            serde_json::Number::from_f64(total)
                .map(Value::Number)
                .ok_or_else(|| GraphError::state(Some(field), "sum is not a finite number"))
        }
        _ => Err(GraphError::state(
            Some(field),
            format!(
                "sum reducer needs numbers, found {} and {}",
                type_name(old),
                type_name(partial)
            ),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declared type and reducer of a single field
#[derive(Debug, Clone, Default)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub reducer: Reducer,
}

/// Field declarations for the shared run state
///
/// Schemas are strict by default: a node writing an undeclared field aborts the
/// run with [`GraphError::Invariant`]. Call [`StateSchema::allow_undeclared`]
/// to accept unknown fields with overwrite semantics.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldSpec>,
    allow_undeclared: bool,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field using the overwrite reducer
    pub fn field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field_with_reducer(name, field_type, Reducer::Overwrite)
    }

    /// Declare a field with an explicit reducer
    pub fn field_with_reducer(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        reducer: Reducer,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                reducer,
            },
        );
        self
    }

    /// Accept writes to fields that were never declared
    pub fn allow_undeclared(mut self) -> Self {
        self.allow_undeclared = true;
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check caller-supplied values before a run starts
    pub fn validate_input(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in values {
            match self.fields.get(name) {
                Some(spec) => check_type(name, spec.field_type, value)?,
                None if self.allow_undeclared => {}
                None => {
                    return Err(GraphError::state(
                        Some(name.as_str()),
                        "field is not declared in the state schema",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Fold one node's partial update into `values`
    ///
    /// `update` must be a JSON object (or null for "no change"). Writing an
    /// undeclared field into a strict schema is an invariant violation.
    pub fn apply_update(
        &self,
        values: &mut BTreeMap<String, Value>,
        node: &str,
        update: &Value,
    ) -> Result<()> {
        let fields = match update {
            Value::Null => return Ok(()),
            Value::Object(fields) => fields,
            other => {
                return Err(GraphError::Invariant(format!(
                    "node '{}' produced a {} update, expected an object",
                    node,
                    type_name(other)
                )))
            }
        };

        for (name, partial) in fields {
            let spec = match self.fields.get(name) {
                Some(spec) => spec,
                None if self.allow_undeclared => {
                    values.insert(name.clone(), partial.clone());
                    continue;
                }
                None => {
                    return Err(GraphError::Invariant(format!(
                        "node '{}' wrote unknown field '{}'",
                        node, name
                    )))
                }
            };

            let merged = spec.reducer.apply(name, values.remove(name), partial.clone())?;
            check_type(name, spec.field_type, &merged)?;
            values.insert(name.clone(), merged);
        }
        Ok(())
    }

    /// Merge several updates, in ascending node-id order
    pub fn merge_all<'a, I>(&self, values: &mut BTreeMap<String, Value>, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut ordered: Vec<(&str, &Value)> = updates.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));
        for (node, update) in ordered {
            self.apply_update(values, node, update)?;
        }
        Ok(())
    }
}

fn check_type(name: &str, field_type: FieldType, value: &Value) -> Result<()> {
    if field_type.accepts(value) {
        Ok(())
    } else {
        Err(GraphError::state(
            Some(name),
            format!("expected {:?}, found {}", field_type, type_name(value)).to_lowercase(),
        ))
    }
}
