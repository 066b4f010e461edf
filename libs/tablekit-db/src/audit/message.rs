use crate::config::AuditConfig;
use crate::model::{ColumnDef, ModelDef};
use crate::value::{Record, key_string};

use super::{DiffKind, FieldDiff};

/// Render human-readable lines for one diff list per row.
///
/// `rows` supplies the primary key of each diff list (the same index in
/// `diffs`); fields rejected by the allow/deny lists are skipped.
#[must_use]
pub fn render_messages(
    model: &ModelDef,
    config: &AuditConfig,
    rows: &[&Record],
    diffs: &[Vec<FieldDiff>],
) -> Vec<String> {
    let pk = model.primary_key();
    let mut out = Vec::new();
    for (i, row_diffs) in diffs.iter().enumerate() {
        let key = rows.get(i).map(|r| key_string(r, pk)).unwrap_or_default();
        for d in row_diffs.iter().filter(|d| config.renders(&d.field)) {
            out.push(render_one(model, config, &key, d));
        }
    }
    out
}

fn render_one(model: &ModelDef, config: &AuditConfig, key: &str, d: &FieldDiff) -> String {
    let column = model.column(&d.field);
    let label = column.map_or(d.field.as_str(), ColumnDef::display_label);
    let show = |v: &serde_json::Value| match column {
        Some(c) => c.display(v),
        None => crate::value::display_value(v),
    };
    let template = match d.kind {
        DiffKind::Add => &config.templates.added,
        DiffKind::Edit => &config.templates.edited,
        DiffKind::Remove => &config.templates.removed,
    };
    template
        .replace("{key}", key)
        .replace("{label}", label)
        .replace("{before}", &show(&d.before))
        .replace("{after}", &show(&d.after))
}
