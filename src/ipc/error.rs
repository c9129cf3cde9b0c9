use crate::calc::CalcError;
use crate::sheet::SheetError;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    BadParams(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ReferenceMissing(String),
    #[error("{message}")]
    InUse { message: String, count: i64 },
    #[error("{0}")]
    ConfigInvalid(String),
    #[error("{0}")]
    DbOpen(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Calc(#[from] CalcError),
    #[error(transparent)]
    Sheet(#[from] SheetError),
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::BadParams(_) => "bad_params",
            HandlerError::NoWorkspace => "no_workspace",
            HandlerError::NotFound(_) => "not_found",
            HandlerError::Conflict(_) => "conflict",
            HandlerError::ReferenceMissing(_) => "reference_missing",
            HandlerError::InUse { .. } => "in_use",
            HandlerError::ConfigInvalid(_) => "config_invalid",
            HandlerError::DbOpen(_) => "db_open_failed",
            HandlerError::Db(_) => "db_failed",
            HandlerError::Calc(e) => e.code(),
            HandlerError::Sheet(e) => e.code(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            HandlerError::InUse { count, .. } => Some(json!({ "recordCount": count })),
            _ => None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let code = self.code();
        match &self {
            HandlerError::Db(_)
            | HandlerError::DbOpen(_)
            | HandlerError::ConfigInvalid(_)
            | HandlerError::Calc(CalcError::Db(_))
            | HandlerError::Sheet(SheetError::Io(_)) => {
                error!(request_id = id, code, error = %self, "request failed")
            }
            _ => debug!(request_id = id, code, error = %self, "request rejected"),
        }
        err(id, code, self.to_string(), self.details())
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Wraps a handler outcome in the response envelope.
pub fn respond(id: &str, result: HandlerResult) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let v = respond("7", Ok(json!({ "n": 1 })));
        assert_eq!(v["ok"], json!(true));
        assert_eq!(v["result"]["n"], json!(1));

        let v = respond(
            "8",
            Err(HandlerError::InUse {
                message: "student S1 has 2 records".into(),
                count: 2,
            }),
        );
        assert_eq!(v["id"], json!("8"));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("in_use"));
        assert_eq!(v["error"]["details"]["recordCount"], json!(2));
    }

    #[test]
    fn calc_errors_keep_their_codes() {
        let e: HandlerError = CalcError::Validation("subject required".into()).into();
        assert_eq!(e.code(), "bad_params");
        assert_eq!(e.to_string(), "subject required");
    }
}
