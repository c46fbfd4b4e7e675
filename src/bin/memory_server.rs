//! Stdio transport shell (spec §1 "Out of scope": the wire format itself is
//! not specified). Frames one JSON object per line on stdin, dispatches to
//! the six `MemoryService` operations, and writes one JSON object per line
//! on stdout. Logging goes to stderr exclusively so it never corrupts the
//! stdio channel the RPC loop depends on.

use std::process::ExitCode;

use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

use memory_retrieval::MemoryConfig;
use memory_retrieval::MemoryService;
use memory_retrieval::SearchOptions;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("memory_retrieval=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match MemoryConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "fatal: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let service = match MemoryService::init(config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "fatal: failed to initialize memory service");
            return ExitCode::FAILURE;
        }
    };

    run(service).await;
    ExitCode::SUCCESS
}

async fn run(service: MemoryService) {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed request line");
                continue;
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let reply = dispatch(&service, &request).await;
        let framed = json!({ "id": id }).as_object().cloned().map(|mut obj| {
            match reply {
                Ok(result) => {
                    obj.insert("result".to_string(), result);
                }
                Err(message) => {
                    obj.insert("error".to_string(), json!({ "message": message }));
                }
            }
            Value::Object(obj)
        });

        if let Some(framed) = framed {
            let mut out = serde_json::to_vec(&framed).unwrap_or_default();
            out.push(b'\n');
            if stdout.write_all(&out).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    }
}

async fn dispatch(service: &MemoryService, request: &Value) -> Result<Value, String> {
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));

    match method {
        "memory.search" => {
            let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
            let options: SearchOptions = serde_json::from_value(params.clone()).unwrap_or_default();
            to_json(service.memory_search(query, options).await)
        }
        "memory.get" => {
            let path = params.get("path").and_then(|v| v.as_str()).unwrap_or("");
            let from = params.get("from").and_then(|v| v.as_u64()).map(|n| n as u32);
            let lines = params.get("lines").and_then(|v| v.as_u64()).map(|n| n as u32);
            to_json(service.memory_get(path, from, lines))
        }
        "memory.status" => to_json(service.memory_status().await),
        "memory.write" => {
            let content = params.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let category = params.get("category").and_then(|v| v.as_str());
            let source = params.get("source").and_then(|v| v.as_str());
            let evidence = params.get("evidence").and_then(|v| v.as_str());
            to_json(service.memory_write(content, category, source, evidence).await)
        }
        "memory.update" => {
            let old_content = params.get("oldContent").and_then(|v| v.as_str()).unwrap_or("");
            let new_content = params.get("newContent").and_then(|v| v.as_str()).unwrap_or("");
            let category = params.get("category").and_then(|v| v.as_str());
            let source = params.get("source").and_then(|v| v.as_str());
            let evidence = params.get("evidence").and_then(|v| v.as_str());
            to_json(service.memory_update(old_content, new_content, category, source, evidence).await)
        }
        "memory.forget" => {
            let content = params.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let category = params.get("category").and_then(|v| v.as_str());
            to_json(service.memory_forget(content, category).await)
        }
        _ => Err(format!("method not found: {method}")),
    }
}

fn to_json<T: serde::Serialize>(result: memory_retrieval::Result<T>) -> Result<Value, String> {
    match result {
        Ok(value) => serde_json::to_value(value).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}
