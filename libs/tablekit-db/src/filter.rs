//! Boolean filter tree shared by the scope resolver, the query compiler and
//! the nested-where rewrite.
//!
//! The operator set is closed: `Eq, Like, Gt, Gte, Lt, Lte, In` plus the
//! logical nodes `And, Or, Not`. Everything else (`ne`, `notIn`, `between`,
//! ...) is expressed through those.

use std::fmt;

use serde_json::{Map, Value as JsonValue};

use crate::error::{ServiceError, ServiceResult};

/// A column reference, optionally qualified by an association path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub path: Vec<String>,
    pub column: String,
}

impl FieldPath {
    #[must_use]
    pub fn root(column: impl Into<String>) -> Self {
        Self {
            path: Vec::new(),
            column: column.into(),
        }
    }

    /// Parse `"a.b.col"` into path `["a", "b"]` and column `"col"`.
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        match dotted.rsplit_once('.') {
            Some((path, column)) => Self {
                path: path.split('.').map(str::to_owned).collect(),
                column: column.to_owned(),
            },
            None => Self::root(dotted),
        }
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        !self.path.is_empty()
    }

    #[must_use]
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for FieldPath {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.column)
        } else {
            write!(f, "{}.{}", self.path.join("."), self.column)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Like,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Cmp {
        field: FieldPath,
        op: Op,
        value: JsonValue,
    },
}

impl Default for Filter {
    fn default() -> Self {
        Self::all()
    }
}

impl Filter {
    /// The empty conjunction: matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    #[must_use]
    pub fn cmp(field: impl Into<FieldPath>, op: Op, value: impl Into<JsonValue>) -> Self {
        Self::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality; a `null` (or `None`) value compares with `IS NULL`.
    #[must_use]
    pub fn eq(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::cmp(field, Op::Eq, value)
    }

    #[must_use]
    pub fn ne(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::not(Self::eq(field, value))
    }

    #[must_use]
    pub fn gt(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::cmp(field, Op::Gt, value)
    }

    #[must_use]
    pub fn gte(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::cmp(field, Op::Gte, value)
    }

    #[must_use]
    pub fn lt(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::cmp(field, Op::Lt, value)
    }

    #[must_use]
    pub fn lte(field: impl Into<FieldPath>, value: impl Into<JsonValue>) -> Self {
        Self::cmp(field, Op::Lte, value)
    }

    /// Raw `LIKE` pattern; the caller owns escaping.
    #[must_use]
    pub fn like(field: impl Into<FieldPath>, pattern: impl Into<String>) -> Self {
        Self::cmp(field, Op::Like, JsonValue::String(pattern.into()))
    }

    #[must_use]
    pub fn in_list<I, V>(field: impl Into<FieldPath>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        Self::cmp(
            field,
            Op::In,
            JsonValue::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    #[must_use]
    pub fn not_in<I, V>(field: impl Into<FieldPath>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        Self::not(Self::in_list(field, values))
    }

    #[must_use]
    pub fn is_null(field: impl Into<FieldPath>) -> Self {
        Self::eq(field, JsonValue::Null)
    }

    #[must_use]
    pub fn not_null(field: impl Into<FieldPath>) -> Self {
        Self::ne(field, JsonValue::Null)
    }

    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn not(inner: Self) -> Self {
        Self::Not(Box::new(inner))
    }

    #[must_use]
    pub fn and(items: Vec<Self>) -> Self {
        Self::And(items)
    }

    #[must_use]
    pub fn or(items: Vec<Self>) -> Self {
        Self::Or(items)
    }

    /// Conjoin two filters, flattening nested conjunctions.
    #[must_use]
    pub fn and_with(self, other: Self) -> Self {
        let mut items = self.into_conjuncts();
        items.extend(other.into_conjuncts());
        Self::And(items)
    }

    /// Top-level conjuncts (a non-`And` filter is its own single conjunct).
    #[must_use]
    pub fn into_conjuncts(self) -> Vec<Self> {
        match self {
            Self::And(items) => items.into_iter().flat_map(Self::into_conjuncts).collect(),
            other => vec![other],
        }
    }

    /// True for the empty conjunction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(items) => items.iter().all(Self::is_empty),
            _ => false,
        }
    }

    /// Root column constrained by this node when it is a plain leaf or a negated leaf.
    #[must_use]
    pub fn constrained_root_column(&self) -> Option<&str> {
        match self {
            Self::Cmp { field, .. } if !field.is_joined() => Some(&field.column),
            Self::Not(inner) => inner.constrained_root_column(),
            _ => None,
        }
    }

    /// Visit every comparison leaf.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a FieldPath, Op, &'a JsonValue)) {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.for_each_leaf(f);
                }
            }
            Self::Not(inner) => inner.for_each_leaf(f),
            Self::Cmp { field, op, value } => f(field, *op, value),
        }
    }

    /// True if any leaf references an association path.
    #[must_use]
    pub fn has_joined_leaf(&self) -> bool {
        let mut found = false;
        self.for_each_leaf(&mut |field, _, _| found |= field.is_joined());
        found
    }

    /// Equality filter from a flat params object; arrays become `In`.
    #[must_use]
    pub fn from_params(params: &Map<String, JsonValue>) -> Self {
        Self::And(
            params
                .iter()
                .map(|(k, v)| match v {
                    JsonValue::Array(items) => Self::in_list(FieldPath::root(k), items.clone()),
                    other => Self::eq(FieldPath::root(k), other.clone()),
                })
                .collect(),
        )
    }

    /// Parse the adapter's loosely-typed filter object.
    ///
    /// Plain keys compare root columns, `$a.b.col$` keys are join-qualified,
    /// `$and`/`$or`/`$not` combine, operator objects (`{"$gte": 3}`) constrain a
    /// single field.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` for unknown operators or malformed shapes.
    pub fn from_json(value: &JsonValue) -> ServiceResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::all()),
            JsonValue::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<ServiceResult<Vec<_>>>()
                .map(Self::And),
            JsonValue::Object(map) => {
                let mut items = Vec::with_capacity(map.len());
                for (key, v) in map {
                    items.push(parse_entry(key, v)?);
                }
                Ok(Self::And(items))
            }
            other => Err(ServiceError::invalid_options(format!(
                "filter must be an object or array, got {other}"
            ))),
        }
    }
}

fn operator_name(key: &str) -> &str {
    key.strip_prefix('$').unwrap_or(key)
}

fn parse_group(v: &JsonValue) -> ServiceResult<Vec<Filter>> {
    match v {
        JsonValue::Array(items) => items.iter().map(Filter::from_json).collect(),
        JsonValue::Object(map) => map.iter().map(|(k, v)| parse_entry(k, v)).collect(),
        other => Err(ServiceError::invalid_options(format!(
            "logical group must be an array or object, got {other}"
        ))),
    }
}

fn parse_entry(key: &str, v: &JsonValue) -> ServiceResult<Filter> {
    match key {
        "$and" => return parse_group(v).map(Filter::And),
        "$or" => return parse_group(v).map(Filter::Or),
        "$not" => return Filter::from_json(v).map(Filter::not),
        _ => {}
    }

    let field = match key
        .strip_prefix('$')
        .and_then(|k| k.strip_suffix('$'))
    {
        Some(inner) if !inner.is_empty() => FieldPath::parse(inner),
        _ => FieldPath::root(key),
    };
    parse_field_value(&field, v)
}

fn parse_field_value(field: &FieldPath, v: &JsonValue) -> ServiceResult<Filter> {
    match v {
        JsonValue::Array(items) => Ok(Filter::in_list(field.clone(), items.clone())),
        JsonValue::Object(ops) => {
            let mut items = Vec::with_capacity(ops.len());
            for (op, arg) in ops {
                items.push(parse_operator(field, op, arg)?);
            }
            Ok(Filter::And(items))
        }
        scalar => Ok(Filter::eq(field.clone(), scalar.clone())),
    }
}

fn parse_operator(field: &FieldPath, op: &str, arg: &JsonValue) -> ServiceResult<Filter> {
    let f = field.clone();
    Ok(match operator_name(op) {
        "eq" | "is" => Filter::eq(f, arg.clone()),
        "ne" => Filter::ne(f, arg.clone()),
        "not" => match arg {
            JsonValue::Null => Filter::not_null(f),
            other => Filter::ne(f, other.clone()),
        },
        "gt" => Filter::gt(f, arg.clone()),
        "gte" => Filter::gte(f, arg.clone()),
        "lt" => Filter::lt(f, arg.clone()),
        "lte" => Filter::lte(f, arg.clone()),
        "like" => Filter::cmp(f, Op::Like, arg.clone()),
        "notLike" => Filter::not(Filter::cmp(f, Op::Like, arg.clone())),
        "in" => Filter::in_list(f, expect_array(op, arg)?),
        "notIn" | "nin" => Filter::not_in(f, expect_array(op, arg)?),
        "between" => match expect_array(op, arg)?.as_slice() {
            [lo, hi] => Filter::And(vec![
                Filter::gte(field.clone(), lo.clone()),
                Filter::lte(f, hi.clone()),
            ]),
            _ => {
                return Err(ServiceError::invalid_options(format!(
                    "'{op}' on '{field}' expects two values"
                )));
            }
        },
        "and" => Filter::And(parse_field_group(field, arg)?),
        "or" => Filter::Or(parse_field_group(field, arg)?),
        _ => {
            return Err(ServiceError::invalid_options(format!(
                "unknown operator '{op}' on '{field}'"
            )));
        }
    })
}

fn parse_field_group(field: &FieldPath, arg: &JsonValue) -> ServiceResult<Vec<Filter>> {
    match arg {
        JsonValue::Array(items) => items.iter().map(|v| parse_field_value(field, v)).collect(),
        other => Ok(vec![parse_field_value(field, other)?]),
    }
}

fn expect_array(op: &str, arg: &JsonValue) -> ServiceResult<Vec<JsonValue>> {
    match arg {
        JsonValue::Array(items) => Ok(items.clone()),
        other => Err(ServiceError::invalid_options(format!(
            "'{op}' expects an array, got {other}"
        ))),
    }
}
