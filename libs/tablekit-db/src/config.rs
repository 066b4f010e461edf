//! Service configuration.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Resolution used when writing "now" into integer timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Millis,
}

/// Configuration for a `Service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Page size used when the request does not carry one.
    pub default_page_size: u64,
    /// Upper bound for any requested page size.
    pub max_page_size: u64,
    /// Rank column used by the ordered-list operations unless overridden per call.
    pub rank_column: String,
    /// Template for locale-aware ordering. `{column}` is replaced by the quoted,
    /// table-qualified storage column and `{locale}` by the marker content.
    pub locale_order_template: String,
    pub timestamp_unit: TimestampUnit,
    pub audit: AuditConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 1000,
            rank_column: "rank".to_owned(),
            locale_order_template: "CONVERT({column} USING {locale})".to_owned(),
            timestamp_unit: TimestampUnit::Seconds,
            audit: AuditConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Default figment stack: built-in defaults, then the YAML file, then
    /// `TABLEKIT_` prefixed environment variables (`__` separates nesting).
    #[must_use]
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TABLEKIT_").split("__"))
    }

    /// Extract a configuration from any figment.
    ///
    /// # Errors
    /// Returns `ServiceError::InvalidOptions` if the sources do not deserialize.
    pub fn from_figment(figment: &Figment) -> Result<Self, ServiceError> {
        figment
            .extract()
            .map_err(|e| ServiceError::invalid_options(format!("config: {e}")))
    }
}

/// Audit log rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Record `AuditRecord`s for mutating operations.
    pub enabled: bool,
    /// When non-empty, only these fields appear in rendered messages.
    pub fields: Vec<String>,
    /// Fields never rendered, even when allow-listed.
    pub exclude_fields: Vec<String>,
    pub templates: MessageTemplates,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fields: Vec::new(),
            exclude_fields: Vec::new(),
            templates: MessageTemplates::default(),
        }
    }
}

impl AuditConfig {
    /// Whether `field` may appear in a rendered message.
    #[must_use]
    pub fn renders(&self, field: &str) -> bool {
        if self.exclude_fields.iter().any(|f| f == field) {
            return false;
        }
        self.fields.is_empty() || self.fields.iter().any(|f| f == field)
    }
}

/// Message templates. Placeholders: `{key}`, `{label}`, `{before}`, `{after}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessageTemplates {
    pub added: String,
    pub edited: String,
    pub removed: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            added: "[{key}] {label}: set to \"{after}\"".to_owned(),
            edited: "[{key}] {label}: \"{before}\" -> \"{after}\"".to_owned(),
            removed: "[{key}] {label}: cleared (was \"{before}\")".to_owned(),
        }
    }
}
