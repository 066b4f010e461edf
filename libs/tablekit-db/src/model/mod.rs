//! Model metadata: columns, keys, associations and audit fields of a table.
//!
//! Metadata is declared once, validated when the [`Schema`] is built and then
//! shared read-only (`Arc`) by every service operation.

mod path;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{ServiceError, ServiceResult};
use crate::value::display_value;

pub use path::{AssociationPath, AssociationStep, Link, PathCache};

/// Declared column type. Drives value coercion and the scope predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Integer,
    Float,
    Boolean,
    Uuid,
    DateTime,
    Date,
    Json,
}

impl ColumnKind {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// A single column: logical name, storage field and presentation data.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    name: String,
    field: String,
    kind: ColumnKind,
    nullable: bool,
    label: Option<String>,
    value_labels: BTreeMap<String, String>,
}

impl ColumnDef {
    /// Non-nullable column whose storage field equals its logical name.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let name = name.into();
        Self {
            field: name.clone(),
            name,
            kind,
            nullable: false,
            label: None,
            value_labels: BTreeMap::new(),
        }
    }

    /// Map the logical name onto a differently named storage column.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Display label for one enumerated value, used when rendering audit messages.
    #[must_use]
    pub fn value_label(mut self, value: impl Into<JsonValue>, label: impl Into<String>) -> Self {
        self.value_labels
            .insert(display_value(&value.into()), label.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage column name.
    #[must_use]
    pub fn storage(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Display label, falling back to the logical name.
    #[must_use]
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn is_enumerated(&self) -> bool {
        !self.value_labels.is_empty()
    }

    /// Translate a value through the enumerated labels; plain display otherwise.
    #[must_use]
    pub fn display(&self, value: &JsonValue) -> String {
        let raw = display_value(value);
        self.value_labels.get(&raw).cloned().unwrap_or(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
}

impl AssociationKind {
    /// Whether a loaded association is a single record (or null) rather than a list.
    #[must_use]
    pub fn is_single(self) -> bool {
        matches!(self, Self::BelongsTo | Self::HasOne)
    }
}

/// A declared relationship from one model to another.
///
/// Key semantics per kind:
/// - `BelongsTo`: `foreign_key` lives on the source, `target_key` on the target.
/// - `HasOne`/`HasMany`: `foreign_key` lives on the target, `source_key` on the source.
/// - `BelongsToMany`: `foreign_key` and `other_key` live on the `through` model and
///   reference `source_key` and `target_key` respectively.
///
/// Missing `source_key`/`target_key` default to the respective primary key.
#[derive(Debug, Clone)]
pub struct AssociationDef {
    name: String,
    kind: AssociationKind,
    target: String,
    foreign_key: String,
    source_key: Option<String>,
    target_key: Option<String>,
    through: Option<String>,
    other_key: Option<String>,
    conditions: Vec<(String, JsonValue)>,
}

impl AssociationDef {
    fn new(
        name: impl Into<String>,
        kind: AssociationKind,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
            source_key: None,
            target_key: None,
            through: None,
            other_key: None,
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, AssociationKind::BelongsTo, target, foreign_key)
    }

    #[must_use]
    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, AssociationKind::HasOne, target, foreign_key)
    }

    #[must_use]
    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, AssociationKind::HasMany, target, foreign_key)
    }

    #[must_use]
    pub fn belongs_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        foreign_key: impl Into<String>,
        other_key: impl Into<String>,
    ) -> Self {
        let mut def = Self::new(name, AssociationKind::BelongsToMany, target, foreign_key);
        def.through = Some(through.into());
        def.other_key = Some(other_key.into());
        def
    }

    #[must_use]
    pub fn source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }

    /// Constant predicate on the target side, e.g. the type discriminator of a
    /// polymorphic association (`commentable_type = "post"`).
    #[must_use]
    pub fn with_condition(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    #[must_use]
    pub fn through(&self) -> Option<&str> {
        self.through.as_deref()
    }

    #[must_use]
    pub fn other_key(&self) -> Option<&str> {
        self.other_key.as_deref()
    }

    #[must_use]
    pub fn conditions(&self) -> &[(String, JsonValue)] {
        &self.conditions
    }

    pub(crate) fn explicit_source_key(&self) -> Option<&str> {
        self.source_key.as_deref()
    }

    pub(crate) fn explicit_target_key(&self) -> Option<&str> {
        self.target_key.as_deref()
    }
}

/// Names of the audit columns a model declares. All optional.
#[derive(Debug, Clone, Default)]
pub struct AuditFields {
    pub created_by: Option<String>,
    pub created_at: Option<String>,
    pub updated_by: Option<String>,
    pub updated_at: Option<String>,
    pub deleted_by: Option<String>,
    pub deleted_at: Option<String>,
}

impl AuditFields {
    fn declared(&self) -> impl Iterator<Item = &str> {
        [
            &self.created_by,
            &self.created_at,
            &self.updated_by,
            &self.updated_at,
            &self.deleted_by,
            &self.deleted_at,
        ]
        .into_iter()
        .filter_map(|f| f.as_deref())
    }

    /// Whether the model supports soft deletion.
    #[must_use]
    pub fn is_paranoid(&self) -> bool {
        self.deleted_at.is_some() || self.deleted_by.is_some()
    }
}

/// Read-only metadata for one table.
#[derive(Debug, Clone)]
pub struct ModelDef {
    name: String,
    table: String,
    columns: Vec<ColumnDef>,
    index: HashMap<String, usize>,
    primary_key: Vec<String>,
    unique: Vec<Vec<String>>,
    associations: Vec<AssociationDef>,
    audit: AuditFields,
    rank: Option<String>,
}

impl ModelDef {
    #[must_use]
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> ModelDefBuilder {
        ModelDefBuilder {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique: Vec::new(),
            associations: Vec::new(),
            audit: AuditFields::default(),
            rank: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    /// Declaration index of a column.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resolve a logical column name.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownColumn` if the model does not declare it.
    pub fn resolve_column(&self, name: &str) -> ServiceResult<&ColumnDef> {
        self.column(name)
            .ok_or_else(|| ServiceError::unknown_column(&self.name, name))
    }

    /// Storage column behind a logical name.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownColumn` if the model does not declare it.
    pub fn storage_name(&self, name: &str) -> ServiceResult<&str> {
        self.resolve_column(name).map(ColumnDef::storage)
    }

    #[must_use]
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Primary key, or an error for key-less models.
    ///
    /// # Errors
    /// Returns `ServiceError::MissingPrimaryKey` if the model declares none.
    pub fn require_primary_key(&self) -> ServiceResult<&[String]> {
        if self.primary_key.is_empty() {
            return Err(ServiceError::MissingPrimaryKey(self.name.clone()));
        }
        Ok(&self.primary_key)
    }

    #[must_use]
    pub fn unique_constraints(&self) -> &[Vec<String>] {
        &self.unique
    }

    #[must_use]
    pub fn associations(&self) -> &[AssociationDef] {
        &self.associations
    }

    #[must_use]
    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    #[must_use]
    pub fn audit_fields(&self) -> &AuditFields {
        &self.audit
    }

    /// Rank column declared on the model, if any.
    #[must_use]
    pub fn rank_column(&self) -> Option<&str> {
        self.rank.as_deref()
    }
}

pub struct ModelDefBuilder {
    name: String,
    table: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    unique: Vec<Vec<String>>,
    associations: Vec<AssociationDef>,
    audit: AuditFields,
    rank: Option<String>,
}

impl ModelDefBuilder {
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn association(mut self, association: AssociationDef) -> Self {
        self.associations.push(association);
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: AuditFields) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn rank(mut self, column: impl Into<String>) -> Self {
        self.rank = Some(column.into());
        self
    }

    /// Validate column references and freeze the model.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownColumn` when a key, unique constraint, audit
    /// field or the rank column names an undeclared column, and
    /// `ServiceError::InvalidOptions` on duplicate column names.
    pub fn build(self) -> ServiceResult<ModelDef> {
        let mut index = HashMap::with_capacity(self.columns.len());
        for (i, c) in self.columns.iter().enumerate() {
            if index.insert(c.name.clone(), i).is_some() {
                return Err(ServiceError::invalid_options(format!(
                    "duplicate column '{}' on model '{}'",
                    c.name, self.name
                )));
            }
        }

        let referenced = self
            .primary_key
            .iter()
            .map(String::as_str)
            .chain(self.unique.iter().flatten().map(String::as_str))
            .chain(self.audit.declared())
            .chain(self.rank.as_deref());
        for name in referenced {
            if !index.contains_key(name) {
                return Err(ServiceError::unknown_column(&self.name, name));
            }
        }

        Ok(ModelDef {
            name: self.name,
            table: self.table,
            columns: self.columns,
            index,
            primary_key: self.primary_key,
            unique: self.unique,
            associations: self.associations,
            audit: self.audit,
            rank: self.rank,
        })
    }
}

/// Registry of models by name.
#[derive(Debug, Default)]
pub struct Schema {
    models: HashMap<String, Arc<ModelDef>>,
}

impl Schema {
    /// Build a schema and validate every association against it.
    ///
    /// # Errors
    /// Returns `UnknownModel` for unresolved targets/through models and
    /// `UnknownColumn` for association keys that do not exist.
    pub fn new(models: impl IntoIterator<Item = ModelDef>) -> ServiceResult<Self> {
        let schema = Self {
            models: models
                .into_iter()
                .map(|m| (m.name.clone(), Arc::new(m)))
                .collect(),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a model.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownModel` if no model has that name.
    pub fn model(&self, name: &str) -> ServiceResult<Arc<ModelDef>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownModel(name.to_owned()))
    }

    fn validate(&self) -> ServiceResult<()> {
        for model in self.models.values() {
            for assoc in &model.associations {
                path::resolve_step(self, model, assoc)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn user() -> ModelDefBuilder {
        ModelDef::builder("User", "users")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("name", ColumnKind::String).field("user_name"))
            .column(
                ColumnDef::new("status", ColumnKind::Integer)
                    .label("Status")
                    .value_label(1, "Active")
                    .value_label(2, "Locked"),
            )
            .primary_key(["id"])
    }

    #[test]
    fn test_resolve_column_through_storage_mapping() {
        let m = user().build().unwrap();
        assert_eq!(m.storage_name("name").unwrap(), "user_name");
        assert_eq!(m.storage_name("id").unwrap(), "id");
        assert!(matches!(
            m.storage_name("missing"),
            Err(ServiceError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_enumerated_display() {
        let m = user().build().unwrap();
        let status = m.column("status").unwrap();
        assert!(status.is_enumerated());
        assert_eq!(status.display(&JsonValue::from(2)), "Locked");
        assert_eq!(status.display(&JsonValue::from(9)), "9");
        assert_eq!(status.display_label(), "Status");
        assert_eq!(m.column("name").unwrap().display_label(), "name");
    }

    #[test]
    fn test_build_rejects_unknown_audit_column() {
        let res = user()
            .audit(AuditFields {
                deleted_at: Some("delete_time".to_owned()),
                ..AuditFields::default()
            })
            .build();
        assert!(matches!(res, Err(ServiceError::UnknownColumn { .. })));
    }

    #[test]
    fn test_schema_rejects_unknown_target() {
        let m = user()
            .association(AssociationDef::has_many("orders", "Order", "user_id"))
            .build()
            .unwrap();
        assert!(matches!(
            Schema::new([m]),
            Err(ServiceError::UnknownModel(name)) if name == "Order"
        ));
    }

    #[test]
    fn test_schema_rejects_unknown_foreign_key() {
        let order = ModelDef::builder("Order", "orders")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .primary_key(["id"])
            .build()
            .unwrap();
        let m = user()
            .association(AssociationDef::has_many("orders", "Order", "user_id"))
            .build()
            .unwrap();
        assert!(matches!(
            Schema::new([m, order]),
            Err(ServiceError::UnknownColumn { column, .. }) if column == "user_id"
        ));
    }
}
