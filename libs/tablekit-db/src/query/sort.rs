//! Sort entries and their compiled order terms.

use serde_json::Value as JsonValue;

use crate::error::{ServiceError, ServiceResult};
use crate::filter::FieldPath;
use crate::model::{AssociationStep, ModelDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Parse an explicit direction token (`ASC`/`DESC`, any case).
    #[must_use]
    pub fn token(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("asc") {
            Some(Self::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Some(Self::Desc)
        } else {
            None
        }
    }
}

/// One requested ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortEntry {
    pub field: FieldPath,
    pub direction: Direction,
    /// Locale marker (`name[gbk]`) requesting a locale-aware ordering expression.
    pub locale: Option<String>,
}

impl SortEntry {
    #[must_use]
    pub fn asc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
            locale: None,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
            locale: None,
        }
    }

    /// Parse `"+name"`, `"-createTime"`, `"team.name"` or `"name[gbk]"`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let (direction, rest) = match s.as_bytes().first() {
            Some(b'-') => (Direction::Desc, &s[1..]),
            Some(b'+') => (Direction::Asc, &s[1..]),
            _ => (Direction::Asc, s),
        };
        let (name, locale) = split_locale(rest.trim());
        Self {
            field: FieldPath::parse(name),
            direction,
            locale,
        }
    }

    /// Array form: path segments and column, optionally followed by a direction token.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` if no column is given.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> ServiceResult<Self> {
        let mut segments: Vec<&str> = parts.iter().map(AsRef::as_ref).collect();
        let direction = match segments.last().and_then(|s| Direction::token(s)) {
            Some(d) => {
                segments.pop();
                d
            }
            None => Direction::Asc,
        };
        let Some(last) = segments.pop() else {
            return Err(ServiceError::invalid_options("sort entry without a column"));
        };
        let (column, locale) = split_locale(last);
        let mut field = FieldPath::parse(column);
        let mut path: Vec<String> = segments
            .iter()
            .flat_map(|s| s.split('.'))
            .map(str::to_owned)
            .collect();
        path.append(&mut field.path);
        field.path = path;
        Ok(Self {
            field,
            direction,
            locale,
        })
    }

    /// Parse a JSON sort list: strings and arrays of strings.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` for other shapes.
    pub fn list_from_json(value: &JsonValue) -> ServiceResult<Vec<Self>> {
        let items = match value {
            JsonValue::Null => return Ok(Vec::new()),
            JsonValue::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Ok(Self::parse(s)),
                JsonValue::Array(parts) => {
                    let parts: Vec<&str> = parts.iter().filter_map(JsonValue::as_str).collect();
                    Self::from_parts(&parts)
                }
                other => Err(ServiceError::invalid_options(format!(
                    "sort entry must be a string or array, got {other}"
                ))),
            })
            .collect()
    }
}

fn split_locale(s: &str) -> (&str, Option<String>) {
    if let Some(body) = s.strip_suffix(']')
        && let Some((name, locale)) = body.rsplit_once('[')
    {
        return (name, Some(locale.to_owned()));
    }
    (s, None)
}

/// Locale names are spliced into SQL text; only identifier characters pass.
#[must_use]
pub fn is_safe_locale(locale: &str) -> bool {
    !locale.is_empty()
        && locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A compiled ordering on one query.
#[derive(Debug, Clone)]
pub enum OrderTerm {
    /// A column of the queried model.
    Column { column: String, direction: Direction },
    /// A column of the queried model through the locale template.
    Locale {
        column: String,
        locale: String,
        direction: Direction,
    },
    /// A column reached through single-valued associations, rendered as a
    /// correlated scalar subquery. A locale wraps the selected column in the
    /// locale template.
    Path {
        steps: Vec<AssociationStep>,
        column: String,
        locale: Option<String>,
        direction: Direction,
    },
}

impl OrderTerm {
    /// Root-level term for `entry`, validating the column.
    pub(crate) fn local(model: &ModelDef, entry: &SortEntry) -> ServiceResult<Option<Self>> {
        let column = model.resolve_column(&entry.field.column)?.name().to_owned();
        Ok(match &entry.locale {
            Some(locale) if is_safe_locale(locale) => Some(Self::Locale {
                column,
                locale: locale.clone(),
                direction: entry.direction,
            }),
            Some(locale) => {
                tracing::warn!(locale = %locale, column = %column, "unsafe locale marker, sort entry dropped");
                None
            }
            None => Some(Self::Column {
                column,
                direction: entry.direction,
            }),
        })
    }

    /// Column that has to stay in the projection for this term to resolve.
    pub(crate) fn locale_column(&self) -> Option<&str> {
        match self {
            Self::Locale { column, .. } => Some(column),
            _ => None,
        }
    }
}
