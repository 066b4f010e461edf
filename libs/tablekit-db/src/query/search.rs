//! Free-text and range search.

use serde_json::Value as JsonValue;

use crate::error::{ServiceError, ServiceResult};
use crate::filter::{FieldPath, Filter};

/// What a search matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    Text(String),
    /// Bounds for range matching; `None` leaves that side open.
    Range {
        start: Option<String>,
        end: Option<String>,
    },
}

impl SearchKey {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Range { start, end } => {
                start.as_deref().is_none_or(str::is_empty)
                    && end.as_deref().is_none_or(str::is_empty)
            }
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Range { start, .. } => start.as_deref(),
        }
    }

    fn bounds(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Self::Text(s) => (Some(s.as_str()), None),
            Self::Range { start, end } => (
                start.as_deref().filter(|s| !s.is_empty()),
                end.as_deref().filter(|s| !s.is_empty()),
            ),
        }
    }
}

impl From<&str> for SearchKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for SearchKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<(&str, &str)> for SearchKey {
    fn from((start, end): (&str, &str)) -> Self {
        Self::Range {
            start: Some(start.to_owned()),
            end: Some(end.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Fuzzy,
    Range,
}

/// Which sides of the key (fuzzy) or range (range) are open.
///
/// Fuzzy: `Full` contains, `Left` ends with, `Right` starts with, `None` equals.
/// Range: `Full` inclusive, `Left` lower-inclusive, `Right` upper-inclusive,
/// `None` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bounds {
    #[default]
    Full,
    Left,
    Right,
    None,
}

/// One searchable field, optionally behind an association path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchField {
    pub field: FieldPath,
    pub mode: SearchMode,
    pub bounds: Bounds,
}

impl SearchField {
    /// Parse `"[path.]field[:fuzzy|range[:full|left|right|none]]"`.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` for unknown modes.
    pub fn parse(spec: &str) -> ServiceResult<Self> {
        let mut parts = spec.split(':');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ServiceError::invalid_options("empty search field"));
        }
        let mode = match parts.next() {
            None | Some("" | "fuzzy") => SearchMode::Fuzzy,
            Some("range") => SearchMode::Range,
            Some(other) => {
                return Err(ServiceError::invalid_options(format!(
                    "unknown search mode '{other}' in '{spec}'"
                )));
            }
        };
        let bounds = match parts.next() {
            None | Some("" | "full") => Bounds::Full,
            Some("left") => Bounds::Left,
            Some("right") => Bounds::Right,
            Some("none") => Bounds::None,
            Some(other) => {
                return Err(ServiceError::invalid_options(format!(
                    "unknown search bounds '{other}' in '{spec}'"
                )));
            }
        };
        Ok(Self {
            field: FieldPath::parse(name),
            mode,
            bounds,
        })
    }

    fn predicate(&self, key: &SearchKey) -> Option<Filter> {
        let field = self.field.clone();
        match self.mode {
            SearchMode::Fuzzy => {
                let text = key.text().filter(|t| !t.is_empty())?;
                let escaped = like_escape(text);
                Some(match self.bounds {
                    Bounds::Full => Filter::like(field, format!("%{escaped}%")),
                    Bounds::Left => Filter::like(field, format!("%{escaped}")),
                    Bounds::Right => Filter::like(field, format!("{escaped}%")),
                    Bounds::None => Filter::eq(field, text),
                })
            }
            SearchMode::Range => {
                let (start, end) = key.bounds();
                let lower_inclusive = matches!(self.bounds, Bounds::Full | Bounds::Left);
                let upper_inclusive = matches!(self.bounds, Bounds::Full | Bounds::Right);
                let mut items = Vec::with_capacity(2);
                if let Some(s) = start {
                    items.push(if lower_inclusive {
                        Filter::gte(field.clone(), s)
                    } else {
                        Filter::gt(field.clone(), s)
                    });
                }
                if let Some(e) = end {
                    items.push(if upper_inclusive {
                        Filter::lte(field, e)
                    } else {
                        Filter::lt(field, e)
                    });
                }
                (!items.is_empty()).then_some(Filter::And(items))
            }
        }
    }
}

/// A search request: one key matched against alternative field groups.
///
/// Fields inside a group are AND-ed; groups are OR-ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpec {
    pub key: SearchKey,
    pub groups: Vec<Vec<SearchField>>,
}

impl SearchSpec {
    #[must_use]
    pub fn new(key: impl Into<SearchKey>) -> Self {
        Self {
            key: key.into(),
            groups: Vec::new(),
        }
    }

    /// Add a single-field group.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` if the field shorthand is malformed.
    pub fn field(mut self, spec: &str) -> ServiceResult<Self> {
        self.groups.push(vec![SearchField::parse(spec)?]);
        Ok(self)
    }

    /// Add a group whose fields must all match.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` if any field shorthand is malformed.
    pub fn group<'a>(mut self, specs: impl IntoIterator<Item = &'a str>) -> ServiceResult<Self> {
        let group = specs
            .into_iter()
            .map(SearchField::parse)
            .collect::<ServiceResult<Vec<_>>>()?;
        self.groups.push(group);
        Ok(self)
    }

    /// Parse `{"key": "smith" | ["2", "6"], "fields": ["name", ["a", "b:range"]]}`.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` for malformed input.
    pub fn from_json(value: &JsonValue) -> ServiceResult<Self> {
        let key = match value.get("key") {
            Some(JsonValue::Array(bounds)) => {
                let side = |i: usize| {
                    bounds
                        .get(i)
                        .filter(|v| !v.is_null())
                        .map(crate::value::display_value)
                };
                SearchKey::Range {
                    start: side(0),
                    end: side(1),
                }
            }
            Some(JsonValue::Null) | None => SearchKey::Text(String::new()),
            Some(other) => SearchKey::Text(crate::value::display_value(other)),
        };
        let mut spec = Self::new(key);
        let fields = match value.get("fields") {
            Some(JsonValue::Array(items)) => items.as_slice(),
            _ => return Err(ServiceError::invalid_options("search requires a 'fields' array")),
        };
        for item in fields {
            spec = match item {
                JsonValue::String(s) => spec.field(s)?,
                JsonValue::Array(group) => spec.group(group.iter().filter_map(JsonValue::as_str))?,
                other => {
                    return Err(ServiceError::invalid_options(format!(
                        "search field must be a string or array, got {other}"
                    )));
                }
            };
        }
        Ok(spec)
    }

    /// Compile into an OR-of-AND filter, keeping only fields `accept` approves.
    ///
    /// Returns `None` when the key is empty or no field survives.
    pub(crate) fn to_filter(&self, accept: &mut impl FnMut(&SearchField) -> bool) -> Option<Filter> {
        if self.key.is_empty() {
            return None;
        }
        let branches: Vec<Filter> = self
            .groups
            .iter()
            .filter_map(|group| {
                let preds: Vec<Filter> = group
                    .iter()
                    .filter(|f| accept(*f))
                    .filter_map(|f| f.predicate(&self.key))
                    .collect();
                (!preds.is_empty()).then_some(Filter::And(preds))
            })
            .collect();
        (!branches.is_empty()).then_some(Filter::Or(branches))
    }
}

/// Escape `LIKE` metacharacters; patterns are rendered with `ESCAPE '\'`.
#[must_use]
pub fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
