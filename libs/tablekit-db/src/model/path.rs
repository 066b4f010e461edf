use std::sync::Arc;

use dashmap::DashMap;

use super::{AssociationDef, AssociationKind, ModelDef, Schema};
use crate::error::{ServiceError, ServiceResult};

/// How rows of a step's source relate to rows of its target.
#[derive(Debug, Clone)]
pub enum Link {
    /// `source.source_key = target.target_key`.
    Direct {
        source_key: String,
        target_key: String,
    },
    /// `source.source_key = through.through_source`
    /// and `through.through_target = target.target_key`.
    Through {
        through: Arc<ModelDef>,
        source_key: String,
        through_source: String,
        through_target: String,
        target_key: String,
    },
}

impl Link {
    /// Column on the source that participates in the link.
    #[must_use]
    pub fn source_key(&self) -> &str {
        match self {
            Self::Direct { source_key, .. } | Self::Through { source_key, .. } => source_key,
        }
    }

    /// Column on the target that participates in the link.
    #[must_use]
    pub fn target_key(&self) -> &str {
        match self {
            Self::Direct { target_key, .. } | Self::Through { target_key, .. } => target_key,
        }
    }
}

/// One resolved hop of an association path.
#[derive(Debug, Clone)]
pub struct AssociationStep {
    pub association: AssociationDef,
    pub source: Arc<ModelDef>,
    pub target: Arc<ModelDef>,
    pub link: Link,
}

impl AssociationStep {
    #[must_use]
    pub fn name(&self) -> &str {
        self.association.name()
    }

    #[must_use]
    pub fn kind(&self) -> AssociationKind {
        self.association.kind()
    }
}

/// A dotted association path (`"orders.items"`) resolved into typed steps.
#[derive(Debug, Clone)]
pub struct AssociationPath {
    dotted: String,
    steps: Vec<AssociationStep>,
}

impl AssociationPath {
    #[must_use]
    pub fn dotted(&self) -> &str {
        &self.dotted
    }

    #[must_use]
    pub fn steps(&self) -> &[AssociationStep] {
        &self.steps
    }

    /// Model reached at the end of the path.
    #[must_use]
    pub fn target(&self) -> &Arc<ModelDef> {
        // Paths are never empty: `resolve` rejects empty input.
        &self.steps[self.steps.len() - 1].target
    }

    /// True when every hop yields at most one row (belongs-to / has-one chain).
    #[must_use]
    pub fn is_single_valued(&self) -> bool {
        self.steps.iter().all(|s| s.kind().is_single())
    }

    /// Resolve `dotted` starting from `root`.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownAssociation` if any segment is not declared.
    pub fn resolve(schema: &Schema, root: &Arc<ModelDef>, dotted: &str) -> ServiceResult<Self> {
        if dotted.is_empty() {
            return Err(ServiceError::unknown_association(root.name(), dotted));
        }
        let mut steps = Vec::new();
        let mut current = Arc::clone(root);
        for segment in dotted.split('.') {
            let assoc = current
                .association(segment)
                .ok_or_else(|| ServiceError::unknown_association(root.name(), dotted))?;
            let step = resolve_step(schema, &current, assoc)?;
            current = Arc::clone(&step.target);
            steps.push(step);
        }
        Ok(Self {
            dotted: dotted.to_owned(),
            steps,
        })
    }
}

pub(super) fn resolve_step(
    schema: &Schema,
    source: &Arc<ModelDef>,
    assoc: &AssociationDef,
) -> ServiceResult<AssociationStep> {
    let target = schema.model(assoc.target())?;
    let source_pk = || first_key(source);
    let target_pk = || first_key(&target);

    let link = match assoc.kind() {
        AssociationKind::BelongsTo => Link::Direct {
            source_key: assoc.foreign_key().to_owned(),
            target_key: match assoc.explicit_target_key() {
                Some(k) => k.to_owned(),
                None => target_pk()?,
            },
        },
        AssociationKind::HasOne | AssociationKind::HasMany => Link::Direct {
            source_key: match assoc.explicit_source_key() {
                Some(k) => k.to_owned(),
                None => source_pk()?,
            },
            target_key: assoc.foreign_key().to_owned(),
        },
        AssociationKind::BelongsToMany => {
            let through_name = assoc
                .through()
                .ok_or_else(|| ServiceError::UnknownModel(format!("{}.through", assoc.name())))?;
            let through = schema.model(through_name)?;
            let other_key = assoc.other_key().unwrap_or_default().to_owned();
            for key in [assoc.foreign_key(), other_key.as_str()] {
                through.resolve_column(key)?;
            }
            Link::Through {
                source_key: match assoc.explicit_source_key() {
                    Some(k) => k.to_owned(),
                    None => source_pk()?,
                },
                through_source: assoc.foreign_key().to_owned(),
                through_target: other_key,
                target_key: match assoc.explicit_target_key() {
                    Some(k) => k.to_owned(),
                    None => target_pk()?,
                },
                through,
            }
        }
    };

    source.resolve_column(link.source_key())?;
    target.resolve_column(link.target_key())?;
    for (column, _) in assoc.conditions() {
        target.resolve_column(column)?;
    }

    Ok(AssociationStep {
        association: assoc.clone(),
        source: Arc::clone(source),
        target,
        link,
    })
}

fn first_key(model: &ModelDef) -> ServiceResult<String> {
    model
        .require_primary_key()
        .map(|pk| pk[0].clone())
}

/// Per-service cache of resolved association paths, keyed by root model and path.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: DashMap<(String, String), Arc<AssociationPath>>,
}

impl PathCache {
    /// Resolve through the cache.
    ///
    /// # Errors
    /// Returns `ServiceError::UnknownAssociation` for undeclared segments.
    pub fn resolve(
        &self,
        schema: &Schema,
        root: &Arc<ModelDef>,
        dotted: &str,
    ) -> ServiceResult<Arc<AssociationPath>> {
        let key = (root.name().to_owned(), dotted.to_owned());
        if let Some(hit) = self.entries.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let resolved = Arc::new(AssociationPath::resolve(schema, root, dotted)?);
        self.entries.insert(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::model::{ColumnDef, ColumnKind};

    fn schema() -> Schema {
        let user = ModelDef::builder("User", "users")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("team_id", ColumnKind::Integer).nullable())
            .primary_key(["id"])
            .association(AssociationDef::has_many("orders", "Order", "user_id"))
            .association(AssociationDef::belongs_to("team", "Team", "team_id"))
            .association(AssociationDef::belongs_to_many(
                "roles", "Role", "UserRole", "user_id", "role_id",
            ))
            .build()
            .unwrap();
        let order = ModelDef::builder("Order", "orders")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("user_id", ColumnKind::Integer))
            .primary_key(["id"])
            .association(AssociationDef::belongs_to("user", "User", "user_id"))
            .build()
            .unwrap();
        let team = ModelDef::builder("Team", "teams")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .primary_key(["id"])
            .build()
            .unwrap();
        let role = ModelDef::builder("Role", "roles")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .primary_key(["id"])
            .build()
            .unwrap();
        let user_role = ModelDef::builder("UserRole", "user_roles")
            .column(ColumnDef::new("user_id", ColumnKind::Integer))
            .column(ColumnDef::new("role_id", ColumnKind::Integer))
            .primary_key(["user_id", "role_id"])
            .build()
            .unwrap();
        Schema::new([user, order, team, role, user_role]).unwrap()
    }

    #[test]
    fn test_resolve_keys_per_kind() {
        let schema = schema();
        let user = schema.model("User").unwrap();

        let orders = AssociationPath::resolve(&schema, &user, "orders").unwrap();
        assert_eq!(orders.steps()[0].link.source_key(), "id");
        assert_eq!(orders.steps()[0].link.target_key(), "user_id");
        assert!(!orders.is_single_valued());

        let team = AssociationPath::resolve(&schema, &user, "team").unwrap();
        assert_eq!(team.steps()[0].link.source_key(), "team_id");
        assert_eq!(team.steps()[0].link.target_key(), "id");
        assert!(team.is_single_valued());

        let roles = AssociationPath::resolve(&schema, &user, "roles").unwrap();
        assert!(matches!(
            &roles.steps()[0].link,
            Link::Through { through_source, through_target, .. }
                if through_source == "user_id" && through_target == "role_id"
        ));
    }

    #[test]
    fn test_multi_level_path() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let path = AssociationPath::resolve(&schema, &user, "orders.user.team").unwrap();
        assert_eq!(path.steps().len(), 3);
        assert_eq!(path.target().name(), "Team");
    }

    #[test]
    fn test_unknown_segment() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        assert!(matches!(
            AssociationPath::resolve(&schema, &user, "orders.nope"),
            Err(ServiceError::UnknownAssociation { path, .. }) if path == "orders.nope"
        ));
    }

    #[test]
    fn test_cache_reuses_entries() {
        let schema = schema();
        let user = schema.model("User").unwrap();
        let cache = PathCache::default();
        let a = cache.resolve(&schema, &user, "orders").unwrap();
        let b = cache.resolve(&schema, &user, "orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }
}
