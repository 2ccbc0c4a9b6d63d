//! `mcpgate` binary: load a config, start the gateway, and serve
//! line-delimited JSON-RPC on stdin/stdout.
//!
//! Usage: `mcpgate [CONFIG_PATH]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use mcpgate::federation::config::{find_config_path, load_config};
use mcpgate::federation::types::error_codes;
use mcpgate::federation::{ErrorObject, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcpgate::init_tracing();

    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let path = find_config_path(explicit.as_deref())?;
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(
        config = %path.display(),
        backends = config.backends.len(),
        api_wrappers = config.api_wrappers.len(),
        "config loaded"
    );

    let gateway = Arc::new(Gateway::new(config));
    let failures = gateway.start().await;
    if !failures.is_empty() {
        tracing::warn!(failed = failures.len(), "some sources failed to start (non-fatal)");
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let gateway = gateway.clone();
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = serve_line(&gateway, &line).await {
                            let _ = out.send(reply.to_string());
                        }
                    });
                }
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    break;
                }
            },
        }
    }

    gateway.shutdown().await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Handle one request line. Notifications get no reply.
async fn serve_line(gateway: &Gateway, line: &str) -> Option<serde_json::Value> {
    let message: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(error_reply(
                serde_json::Value::Null,
                ErrorObject::new(error_codes::PARSE_ERROR, format!("Parse error: {e}")),
            ));
        }
    };

    let id = message.get("id").cloned();
    let Some(method) = message["method"].as_str() else {
        return Some(error_reply(
            id.unwrap_or(serde_json::Value::Null),
            ErrorObject::new(error_codes::INVALID_REQUEST, "Invalid request: missing method"),
        ));
    };

    let Some(id) = id else {
        tracing::debug!(method, "notification received");
        return None;
    };

    let params = message.get("params").cloned();
    Some(match gateway.handle_rpc(method, params).await {
        Ok(result) => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => error_reply(id, error),
    })
}

fn error_reply(id: serde_json::Value, error: ErrorObject) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            tracing::error!(error = %e, "failed to write stdout");
            break;
        }
    }
}
