//! Eager-load graph: include specs, named presets and their compiled form.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::filter::Filter;
use crate::model::{AssociationStep, ModelDef, PathCache, Schema};
use crate::scope::{Scope, apply_scope};

use super::sort::{OrderTerm, SortEntry};

/// One node of the eager-load graph as requested by the caller.
///
/// Every field is optional so that a spec can be layered over a named preset:
/// set fields override the preset, filters are AND-merged and nested includes
/// are merged by alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncludeSpec {
    pub association: Option<String>,
    pub alias: Option<String>,
    pub required: Option<bool>,
    pub scope: Option<Scope>,
    pub attributes: Option<Vec<String>>,
    pub filter: Option<Filter>,
    pub include: Vec<IncludeSpec>,
    pub order: Vec<SortEntry>,
    pub preset: Option<String>,
}

impl IncludeSpec {
    /// Include the association declared under `name` on the parent model.
    #[must_use]
    pub fn association(name: impl Into<String>) -> Self {
        Self {
            association: Some(name.into()),
            ..Self::default()
        }
    }

    /// Include a named preset registered on the service.
    #[must_use]
    pub fn preset(key: impl Into<String>) -> Self {
        Self {
            preset: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn attributes<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn include(mut self, child: IncludeSpec) -> Self {
        self.include.push(child);
        self
    }

    #[must_use]
    pub fn order(mut self, entry: SortEntry) -> Self {
        self.order.push(entry);
        self
    }

    /// Alias the node is attached under: explicit alias, else the association name.
    #[must_use]
    pub fn effective_alias(&self) -> Option<&str> {
        self.alias.as_deref().or(self.association.as_deref())
    }

    /// Layer `overlay` on top of `self`.
    #[must_use]
    pub fn merged_with(self, overlay: IncludeSpec) -> Self {
        let filter = match (self.filter, overlay.filter) {
            (Some(a), Some(b)) => Some(a.and_with(b)),
            (a, b) => b.or(a),
        };
        let mut include = self.include;
        for child in overlay.include {
            let alias = child.effective_alias().map(str::to_owned);
            match include
                .iter()
                .position(|c| alias.is_some() && c.effective_alias() == alias.as_deref())
            {
                Some(i) => {
                    let base = include.remove(i);
                    include.insert(i, base.merged_with(child));
                }
                None => include.push(child),
            }
        }
        Self {
            association: overlay.association.or(self.association),
            alias: overlay.alias.or(self.alias),
            required: overlay.required.or(self.required),
            scope: overlay.scope.or(self.scope),
            attributes: overlay.attributes.or(self.attributes),
            filter,
            include,
            order: if overlay.order.is_empty() {
                self.order
            } else {
                overlay.order
            },
            preset: None,
        }
    }
}

/// Named include presets registered on a service.
#[derive(Debug, Clone, Default)]
pub struct IncludePresets {
    presets: HashMap<String, IncludeSpec>,
}

impl IncludePresets {
    pub fn insert(&mut self, key: impl Into<String>, spec: IncludeSpec) {
        self.presets.insert(key.into(), spec);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&IncludeSpec> {
        self.presets.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Expand the preset reference of `spec` (if any), keeping inline fields on top.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownPreset` when the key is not registered.
    pub fn expand(&self, spec: &IncludeSpec) -> ServiceResult<IncludeSpec> {
        let Some(key) = spec.preset.as_deref() else {
            return Ok(spec.clone());
        };
        let base = self
            .get(key)
            .ok_or_else(|| ServiceError::UnknownPreset(key.to_owned()))?;
        let mut overlay = spec.clone();
        overlay.preset = None;
        let mut merged = base.clone().merged_with(overlay);
        if merged.association.is_none() {
            merged.association = Some(key.to_owned());
        }
        Ok(merged)
    }
}

/// An include resolved against the schema and ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledInclude {
    pub alias: String,
    pub step: AssociationStep,
    pub required: bool,
    /// Own where-clause with scope and association conditions applied,
    /// expressed on the target model.
    pub filter: Filter,
    /// Projection on the target; empty means every column.
    pub attributes: Vec<String>,
    pub order: Vec<OrderTerm>,
    pub children: Vec<CompiledInclude>,
}

impl CompiledInclude {
    pub(crate) fn target(&self) -> &Arc<ModelDef> {
        &self.step.target
    }

    pub(crate) fn is_single(&self) -> bool {
        self.step.kind().is_single()
    }

    /// Compile a list of specs below `parent`.
    pub(crate) fn compile_all(
        schema: &Schema,
        paths: &PathCache,
        presets: &IncludePresets,
        parent: &Arc<ModelDef>,
        specs: &[IncludeSpec],
    ) -> ServiceResult<Vec<Self>> {
        specs
            .iter()
            .map(|spec| Self::compile(schema, paths, presets, parent, spec))
            .collect()
    }

    fn compile(
        schema: &Schema,
        paths: &PathCache,
        presets: &IncludePresets,
        parent: &Arc<ModelDef>,
        spec: &IncludeSpec,
    ) -> ServiceResult<Self> {
        let spec = presets.expand(spec)?;
        let association = spec.association.as_deref().ok_or_else(|| {
            ServiceError::invalid_options(format!(
                "include on '{}' names neither an association nor a preset",
                parent.name()
            ))
        })?;
        let step = paths
            .resolve(schema, parent, association)?
            .steps()
            .first()
            .cloned()
            .ok_or_else(|| ServiceError::unknown_association(parent.name(), association))?;
        let target = Arc::clone(&step.target);

        let mut filter = apply_scope(
            spec.scope.unwrap_or_default(),
            spec.filter.clone().unwrap_or_default(),
            &target,
        );
        for (column, value) in step.association.conditions() {
            filter = filter.and_with(Filter::eq(column.as_str(), value.clone()));
        }

        let children = Self::compile_all(schema, paths, presets, &target, &spec.include)?;

        let mut order = Vec::new();
        for entry in &spec.order {
            if entry.field.is_joined() {
                tracing::warn!(field = %entry.field, include = %association, "joined sort inside include dropped");
                continue;
            }
            order.extend(OrderTerm::local(&target, entry)?);
        }

        let mut attributes = Vec::new();
        if let Some(requested) = &spec.attributes {
            for name in requested {
                target.resolve_column(name)?;
            }
            attributes.extend(requested.iter().cloned());
            if !attributes.is_empty() {
                attributes.push(step.link.target_key().to_owned());
                attributes.extend(children.iter().map(|c| c.step.link.source_key().to_owned()));
                attributes.extend(order.iter().filter_map(OrderTerm::locale_column).map(str::to_owned));
                dedup_in_place(&mut attributes);
            }
        }

        Ok(Self {
            alias: spec
                .effective_alias()
                .unwrap_or(association)
                .to_owned(),
            required: spec.required.unwrap_or(false),
            step,
            filter,
            attributes,
            order,
            children,
        })
    }

    /// Walk `path` (include aliases) down from `includes`.
    pub(crate) fn chain<'a>(includes: &'a [Self], path: &[String]) -> Option<Vec<&'a Self>> {
        let mut chain = Vec::with_capacity(path.len());
        let mut level = includes;
        for segment in path {
            let node = level.iter().find(|i| &i.alias == segment)?;
            chain.push(node);
            level = &node.children;
        }
        (!chain.is_empty()).then_some(chain)
    }

    pub(crate) fn chain_mut<'a>(includes: &'a mut [Self], path: &[String]) -> Option<&'a mut Self> {
        let (first, rest) = path.split_first()?;
        let node = includes.iter_mut().find(|i| &i.alias == first)?;
        if rest.is_empty() {
            Some(node)
        } else {
            Self::chain_mut(&mut node.children, rest)
        }
    }

    /// Chains of includes that are required all the way from the root.
    pub(crate) fn required_chains(includes: &[Self]) -> Vec<Vec<&Self>> {
        let mut out = Vec::new();
        for inc in includes.iter().filter(|i| i.required) {
            out.push(vec![inc]);
            for mut tail in Self::required_chains(&inc.children) {
                tail.insert(0, inc);
                out.push(tail);
            }
        }
        out
    }
}

pub(crate) fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(i.clone()));
}
