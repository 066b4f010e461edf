use serde_json::Value as JsonValue;

use crate::value::Record;

/// Reserved request-query keys consumed by pagination.
pub const PAGINATION_KEYS: [&str; 3] = ["page", "size", "offset"];

/// Resolved `LIMIT`/`OFFSET` for a list query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u64,
    pub offset: u64,
}

impl Page {
    /// Resolve pagination from the request query.
    ///
    /// `page` defaults to 1, `size` to `default_size` (also when 0), `offset`
    /// to 0. Negative or non-numeric values count as absent. The effective
    /// offset is `offset + (page - 1) * size`.
    #[must_use]
    pub fn resolve(query: &Record, default_size: u64, max_size: u64) -> Self {
        let page = read_u64(query.get("page")).unwrap_or(1).max(1);
        let size = match read_u64(query.get("size")) {
            Some(0) | None => default_size,
            Some(s) => s,
        };
        let limit = size.min(max_size.max(1));
        let offset = read_u64(query.get("offset")).unwrap_or(0);
        Self {
            limit,
            offset: offset.saturating_add((page - 1).saturating_mul(limit)),
        }
    }
}

fn read_u64(v: Option<&JsonValue>) -> Option<u64> {
    match v? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
