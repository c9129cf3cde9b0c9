mod calc;
mod db;
mod grading;
mod ipc;
mod logging;
mod model;
mod sheet;

use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

fn main() {
    logging::init();
    info!(version = env!("CARGO_PKG_VERSION"), "homeworkd starting");

    let mut state = ipc::AppState::new();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                debug!(id = %req.id, method = %req.method, "request");
                ipc::handle_request(&mut state, req)
            }
            // No id to echo back.
            Err(e) => {
                warn!(error = %e, "bad request line");
                serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };

        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("homeworkd exiting");
}
