use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ServiceResult;
use crate::filter::{FieldPath, Filter};
use crate::model::ModelDef;
use crate::scope::apply_scope;

use super::include::{CompiledInclude, dedup_in_place};
use super::pagination::{PAGINATION_KEYS, Page};
use super::sort::{OrderTerm, SortEntry, is_safe_locale};
use super::{QueryContext, QueryOptions, Request};

/// A compiled query against one root model.
///
/// The filter still carries join-qualified leaves; they are folded into
/// root key sets by [`super::nested`] at execution time.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub model: Arc<ModelDef>,
    pub filter: Filter,
    pub includes: Vec<CompiledInclude>,
    pub order: Vec<OrderTerm>,
    /// Root projection; empty means every column.
    pub attributes: Vec<String>,
    pub page: Page,
}

enum SortTarget {
    Root(OrderTerm),
    Include(Vec<String>, SortEntry),
    Dropped,
}

impl QueryPlan {
    pub(crate) fn compile(
        ctx: QueryContext<'_>,
        model: &Arc<ModelDef>,
        req: &Request,
        opts: &QueryOptions,
    ) -> ServiceResult<Self> {
        let mut includes = CompiledInclude::compile_all(
            ctx.schema,
            ctx.paths,
            ctx.presets,
            model,
            &opts.include,
        )?;

        let mut filter = Self::request_filter(model, req)?.and_with(opts.filter.clone());
        Self::check_join_paths(ctx, model, &includes, &filter)?;

        for spec in &opts.search {
            let dropped = Self::unresolvable_search_fields(ctx, model, &includes, spec)?;
            if let Some(f) = spec.to_filter(&mut |field| !dropped.contains(&field.field)) {
                filter = filter.and_with(f);
            }
        }
        let filter = apply_scope(opts.scope, filter, model);

        let mut order = Vec::new();
        for entry in &opts.sort {
            match Self::sort_target(model, &includes, entry)? {
                SortTarget::Root(term) => order.push(term),
                SortTarget::Include(path, local) => {
                    if let Some(inc) = CompiledInclude::chain_mut(&mut includes, &path) {
                        let target = Arc::clone(inc.target());
                        inc.order.extend(OrderTerm::local(&target, &local)?);
                    }
                }
                SortTarget::Dropped => {}
            }
        }

        let mut attributes = Vec::new();
        if !opts.attributes.is_empty() {
            for name in &opts.attributes {
                model.resolve_column(name)?;
            }
            attributes.extend(opts.attributes.iter().cloned());
            attributes.extend(includes.iter().map(|i| i.step.link.source_key().to_owned()));
            attributes.extend(order.iter().filter_map(OrderTerm::locale_column).map(str::to_owned));
            dedup_in_place(&mut attributes);
        }

        let max = opts.max_size.unwrap_or(ctx.config.max_page_size);
        let page = Page::resolve(&req.query, ctx.config.default_page_size, max);

        tracing::debug!(
            model = model.name(),
            includes = includes.len(),
            order = order.len(),
            attributes = attributes.len(),
            limit = page.limit,
            offset = page.offset,
            "compiled query plan"
        );

        Ok(Self {
            model: Arc::clone(model),
            filter,
            includes,
            order,
            attributes,
            page,
        })
    }

    /// Params are strict; extra query keys only count when they name a root column.
    fn request_filter(model: &ModelDef, req: &Request) -> ServiceResult<Filter> {
        for key in req.params.keys() {
            model.resolve_column(key)?;
        }
        let mut filter = Filter::from_params(&req.params);
        let extras: serde_json::Map<_, _> = req
            .query
            .iter()
            .filter(|(k, _)| !PAGINATION_KEYS.contains(&k.as_str()) && model.has_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !extras.is_empty() {
            filter = filter.and_with(Filter::from_params(&extras));
        }
        Ok(filter)
    }

    /// Join-qualified filter leaves must name a declared association path.
    fn check_join_paths(
        ctx: QueryContext<'_>,
        model: &Arc<ModelDef>,
        includes: &[CompiledInclude],
        filter: &Filter,
    ) -> ServiceResult<()> {
        let mut paths: Vec<&FieldPath> = Vec::new();
        filter.for_each_leaf(&mut |field, _, _| {
            if field.is_joined() {
                paths.push(field);
            }
        });
        for field in paths {
            if CompiledInclude::chain(includes, &field.path).is_none() {
                ctx.paths.resolve(ctx.schema, model, &field.dotted_path())?;
            }
        }
        Ok(())
    }

    fn unresolvable_search_fields(
        ctx: QueryContext<'_>,
        model: &Arc<ModelDef>,
        includes: &[CompiledInclude],
        spec: &super::SearchSpec,
    ) -> ServiceResult<HashSet<FieldPath>> {
        let mut dropped = HashSet::new();
        for field in spec.groups.iter().flatten() {
            let path = &field.field;
            if !path.is_joined() {
                model.resolve_column(&path.column)?;
                continue;
            }
            if let Some(chain) = CompiledInclude::chain(includes, &path.path) {
                if let Some(last) = chain.last() {
                    last.target().resolve_column(&path.column)?;
                }
                continue;
            }
            if ctx.paths.resolve(ctx.schema, model, &path.dotted_path()).is_err() {
                tracing::warn!(field = %path, model = model.name(), "search field path does not resolve, dropped");
                dropped.insert(path.clone());
            }
        }
        Ok(dropped)
    }

    fn sort_target(
        model: &ModelDef,
        includes: &[CompiledInclude],
        entry: &SortEntry,
    ) -> ServiceResult<SortTarget> {
        if !entry.field.is_joined() {
            return Ok(match OrderTerm::local(model, entry)? {
                Some(term) => SortTarget::Root(term),
                None => SortTarget::Dropped,
            });
        }
        let Some(chain) = CompiledInclude::chain(includes, &entry.field.path) else {
            tracing::warn!(field = %entry.field, "sort path has no matching include, dropped");
            return Ok(SortTarget::Dropped);
        };
        let Some(last) = chain.last() else {
            return Ok(SortTarget::Dropped);
        };
        last.target().resolve_column(&entry.field.column)?;

        if chain.iter().all(|c| c.is_single()) {
            if let Some(locale) = entry.locale.as_deref().filter(|l| !is_safe_locale(l)) {
                tracing::warn!(locale, field = %entry.field, "unsafe locale marker, sort entry dropped");
                return Ok(SortTarget::Dropped);
            }
            return Ok(SortTarget::Root(OrderTerm::Path {
                steps: chain.iter().map(|c| c.step.clone()).collect(),
                column: entry.field.column.clone(),
                locale: entry.locale.clone(),
                direction: entry.direction,
            }));
        }
        if !last.is_single() {
            let local = SortEntry {
                field: FieldPath::root(entry.field.column.clone()),
                direction: entry.direction,
                locale: entry.locale.clone(),
            };
            return Ok(SortTarget::Include(entry.field.path.clone(), local));
        }
        tracing::warn!(field = %entry.field, "sort through a multi-valued path onto a single row, dropped");
        Ok(SortTarget::Dropped)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::error::ServiceError;
    use crate::model::{AssociationDef, AuditFields, ColumnDef, ColumnKind, PathCache, Schema};
    use crate::query::{IncludePresets, IncludeSpec, SearchSpec};
    use serde_json::json;

    fn schema() -> Schema {
        let user = ModelDef::builder("User", "users")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("name", ColumnKind::String))
            .column(ColumnDef::new("teamId", ColumnKind::Integer).nullable())
            .column(ColumnDef::new("deleteTime", ColumnKind::Integer))
            .primary_key(["id"])
            .audit(AuditFields {
                deleted_at: Some("deleteTime".to_owned()),
                ..AuditFields::default()
            })
            .association(AssociationDef::has_many("orders", "Order", "userId"))
            .association(AssociationDef::belongs_to("team", "Team", "teamId"))
            .build()
            .unwrap();
        let order = ModelDef::builder("Order", "orders")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("userId", ColumnKind::Integer))
            .column(ColumnDef::new("amount", ColumnKind::Integer))
            .primary_key(["id"])
            .build()
            .unwrap();
        let team = ModelDef::builder("Team", "teams")
            .column(ColumnDef::new("id", ColumnKind::Integer))
            .column(ColumnDef::new("title", ColumnKind::String))
            .primary_key(["id"])
            .build()
            .unwrap();
        Schema::new([user, order, team]).unwrap()
    }

    fn compile(req: &Request, opts: &QueryOptions) -> ServiceResult<QueryPlan> {
        let schema = schema();
        let paths = PathCache::default();
        let presets = IncludePresets::default();
        let config = ServiceConfig::default();
        let ctx = QueryContext {
            schema: &schema,
            paths: &paths,
            presets: &presets,
            config: &config,
        };
        let user = schema.model("User")?;
        QueryPlan::compile(ctx, &user, req, opts)
    }

    #[test]
    fn test_params_strict_query_loose() {
        let req = Request::new()
            .param("name", "bob")
            .query("page", 2)
            .query("teamId", 3)
            .query("unrelated", "x");
        let plan = compile(&req, &QueryOptions::builder().build()).unwrap();
        let conjuncts = plan.filter.into_conjuncts();
        assert!(conjuncts.contains(&Filter::eq("name", "bob")));
        assert!(conjuncts.contains(&Filter::eq("teamId", 3)));
        assert!(conjuncts.contains(&Filter::eq("deleteTime", 0)));
        assert_eq!(conjuncts.len(), 3);
        assert_eq!(plan.page.offset, 20);

        let bad = Request::new().param("nope", 1);
        assert!(matches!(
            compile(&bad, &QueryOptions::builder().build()),
            Err(ServiceError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_attributes_union_link_keys() {
        let opts = QueryOptions::builder()
            .attributes(["name"])
            .include(IncludeSpec::association("team"))
            .include(IncludeSpec::association("orders"))
            .build();
        let plan = compile(&Request::new(), &opts).unwrap();
        assert_eq!(
            plan.attributes,
            vec!["name".to_owned(), "teamId".to_owned(), "id".to_owned()]
        );
    }

    #[test]
    fn test_locale_sort_column_added_to_attributes() {
        let opts = QueryOptions::builder()
            .attributes(["id"])
            .sort("-name[gbk]")
            .build();
        let plan = compile(&Request::new(), &opts).unwrap();
        assert_eq!(plan.attributes, vec!["id".to_owned(), "name".to_owned()]);
        assert!(matches!(plan.order[0], OrderTerm::Locale { .. }));
    }

    #[test]
    fn test_sort_routing() {
        let opts = QueryOptions::builder()
            .include(IncludeSpec::association("team"))
            .include(IncludeSpec::association("orders"))
            .sort("team.title")
            .sort("-orders.amount")
            .sort("missing.col")
            .build();
        let plan = compile(&Request::new(), &opts).unwrap();
        assert_eq!(plan.order.len(), 1);
        assert!(matches!(plan.order[0], OrderTerm::Path { .. }));
        let orders = plan.includes.iter().find(|i| i.alias == "orders").unwrap();
        assert_eq!(orders.order.len(), 1);
    }

    #[test]
    fn test_path_sort_keeps_locale() {
        let opts = QueryOptions::builder()
            .include(IncludeSpec::association("team"))
            .sort("team.title[gbk]")
            .sort("-team.title[x y]")
            .build();
        let plan = compile(&Request::new(), &opts).unwrap();
        assert_eq!(plan.order.len(), 1);
        assert!(matches!(
            &plan.order[0],
            OrderTerm::Path { locale: Some(l), .. } if l == "gbk"
        ));
    }

    #[test]
    fn test_search_drops_unresolvable_prefix() {
        let spec = SearchSpec::new("x")
            .field("ghost.name")
            .unwrap()
            .field("name")
            .unwrap();
        let opts = QueryOptions::builder().search(spec).build();
        let plan = compile(&Request::new(), &opts).unwrap();
        assert!(!plan.filter.has_joined_leaf());
        assert!(
            plan.filter
                .into_conjuncts()
                .iter()
                .any(|c| matches!(c, Filter::Or(branches) if branches.len() == 1))
        );
    }

    #[test]
    fn test_filter_with_unknown_path_fails() {
        let opts = QueryOptions::builder()
            .filter(Filter::from_json(&json!({"$ghost.name$": "x"})).unwrap())
            .build();
        assert!(matches!(
            compile(&Request::new(), &opts),
            Err(ServiceError::UnknownAssociation { .. })
        ));
    }
}
