use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Identity written into the create/update/delete actor columns of audited tables.
///
/// Tables disagree on how they store who touched a row: some keep the subject
/// UUID, some an integer account id, some a login name. The actor carries
/// whichever representation the deployment uses and is rendered as JSON so the
/// column coercion layer can bind it with the column's declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorId {
    Uuid(Uuid),
    Int(i64),
    Name(String),
}

impl ActorId {
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Uuid(u) => JsonValue::String(u.to_string()),
            Self::Int(n) => JsonValue::from(*n),
            Self::Name(s) => JsonValue::String(s.clone()),
        }
    }
}

impl From<Uuid> for ActorId {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<i64> for ActorId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self::Name(value.to_owned())
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}
