use crate::calc::parse_date;
use chrono::NaiveDate;
use crate::ipc::error::HandlerError;
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::de::DeserializeOwned;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerError> {
    state.db.as_ref().ok_or(HandlerError::NoWorkspace)
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerError> {
    optional_str(req, key).ok_or_else(|| HandlerError::BadParams(format!("missing {}", key)))
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, HandlerError> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerError::BadParams(format!("missing {}", key)))
}

/// Deserializes `params[key]` into `T`.
pub fn body<T: DeserializeOwned>(req: &Request, key: &str) -> Result<T, HandlerError> {
    let raw = req
        .params
        .get(key)
        .ok_or_else(|| HandlerError::BadParams(format!("missing {}", key)))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerError::BadParams(format!("invalid {}: {}", key, e)))
}

/// Optional `YYYY-MM-DD` param; blank means unset.
pub fn optional_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, HandlerError> {
    optional_str(req, key)
        .map(|raw| parse_date(key, &raw))
        .transpose()
        .map_err(HandlerError::from)
}

/// Substring pattern for `LIKE ? ESCAPE '\'`, with wildcards in `needle`
/// matched literally.
pub fn contains_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: i64,
    pub page_size: i64,
}

impl Paging {
    pub fn parse(req: &Request) -> Result<Self, HandlerError> {
        let page = match req.params.get("page") {
            None => 1,
            Some(v) if v.is_null() => 1,
            Some(v) => v
                .as_i64()
                .filter(|p| *p >= 1)
                .ok_or_else(|| HandlerError::BadParams("page must be an integer >= 1".into()))?,
        };
        let page_size = match req.params.get("pageSize") {
            None => DEFAULT_PAGE_SIZE,
            Some(v) if v.is_null() => DEFAULT_PAGE_SIZE,
            Some(v) => v
                .as_i64()
                .filter(|n| (1..=MAX_PAGE_SIZE).contains(n))
                .ok_or_else(|| {
                    HandlerError::BadParams(format!(
                        "pageSize must be an integer in 1..={}",
                        MAX_PAGE_SIZE
                    ))
                })?,
        };
        if (page - 1).checked_mul(page_size).is_none() {
            return Err(HandlerError::BadParams(format!("page {} is out of range", page)));
        }
        Ok(Self { page, page_size })
    }

    /// Row offset of the page; `parse` rejects pages where this overflows.
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

/// Runs a single-column text query and returns the non-null values.
pub fn distinct_strings(
    conn: &Connection,
    sql: &str,
    binds: Vec<Value>,
) -> Result<Vec<String>, HandlerError> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values.into_iter().flatten().collect())
}
