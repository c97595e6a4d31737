//! JSON-RPC 2.0 read API over the federator.
//!
//! A single POST route serves `GetChildNodes`, `IsNodeLeaf` and
//! `GetRangeData`. The body is read raw rather than through the typed JSON
//! extractor so that both `application/json` and `application/json-rpc`
//! clients are accepted; `params` may be a bare object or a one-element
//! array of it.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::federator::LevelFederator;

const LOG: &str = "carbond::reader";

#[derive(Deserialize)]
struct NodeParams {
    #[serde(rename = "Node")]
    node: String,
}

#[derive(Deserialize)]
struct RangeParams {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Start")]
    start: u64,
    #[serde(rename = "End")]
    end: u64,
}

/// Serve the read API on the given port until the process exits.
pub async fn serve(federator: Arc<LevelFederator>, port: u16) -> Result<()> {
    let app = Router::new().route("/", post(handle_rpc)).with_state(federator);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("reader rpc bind failed on port {}", port))?;
    info!(target: LOG, "json-rpc reader listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_rpc(State(federator): State<Arc<LevelFederator>>, body: Bytes) -> Json<Value> {
    let req: Value = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return Json(error_envelope(Value::Null, -32700, &format!("parse error: {}", e))),
    };
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let method = req.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    let params = unwrap_params(req.get("params").cloned().unwrap_or(Value::Null));

    // sled reads are synchronous; keep them off the reactor threads
    let outcome = tokio::task::spawn_blocking(move || dispatch(&federator, &method, params)).await;
    let result = match outcome {
        Ok(result) => result,
        Err(e) => Err((-32603, format!("internal error: {}", e))),
    };

    Json(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "result": value, "id": id }),
        Err((code, message)) => error_envelope(id, code, &message),
    })
}

fn dispatch(federator: &LevelFederator, method: &str, params: Value) -> Result<Value, (i64, String)> {
    match method {
        "GetChildNodes" => {
            let p: NodeParams = parse_params(params)?;
            Ok(json!({ "Nodes": federator.index().list_children(&p.node) }))
        }
        "IsNodeLeaf" => {
            let p: NodeParams = parse_params(params)?;
            Ok(json!({ "Yes": federator.get_metric(&p.node).is_some() }))
        }
        "GetRangeData" => {
            let p: RangeParams = parse_params(params)?;
            let key = federator
                .get_metric(&p.node)
                .ok_or_else(|| (-32000i64, format!("key not found: {}", p.node)))?;
            let data = federator
                .data_scan(&key, p.start, p.end)
                .map_err(|e| (-32602i64, e.to_string()))?;
            Ok(json!({ "Data": data }))
        }
        other => Err((-32601, format!("method not found: {}", other))),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, (i64, String)> {
    serde_json::from_value(params).map_err(|e| (-32602, format!("invalid params: {}", e)))
}

/// Some JSON-RPC client libraries wrap the argument object in a one-element
/// positional array.
fn unwrap_params(params: Value) -> Value {
    match params {
        Value::Array(mut items) if !items.is_empty() => items.remove(0),
        other => other,
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "error": { "code": code, "message": message }, "id": id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leveltsd::federator::LevelTsdConfig;
    use crate::leveltsd::shard::ShardConfig;
    use crate::mq::MetricReading;
    use std::time::Duration;

    fn mk_federator(root: &std::path::Path) -> LevelFederator {
        LevelFederator::open(LevelTsdConfig {
            base_dir: root.to_path_buf(),
            shard: ShardConfig {
                write_batch_fill_timeout: Duration::from_millis(100),
                ..ShardConfig::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn child_nodes_and_leaf_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let federator = mk_federator(tmp.path());
        federator.create_metric("servers.web01.load").unwrap();

        let res = dispatch(&federator, "GetChildNodes", json!({ "Node": "" })).unwrap();
        assert_eq!(res, json!({ "Nodes": ["servers"] }));

        let res = dispatch(&federator, "GetChildNodes", json!({ "Node": "servers" })).unwrap();
        assert_eq!(res, json!({ "Nodes": ["web01"] }));

        let res = dispatch(&federator, "IsNodeLeaf", json!({ "Node": "servers.web01.load" })).unwrap();
        assert_eq!(res, json!({ "Yes": true }));
        let res = dispatch(&federator, "IsNodeLeaf", json!({ "Node": "servers.web01" })).unwrap();
        assert_eq!(res, json!({ "Yes": false }));
        federator.release();
    }

    #[test]
    fn range_data_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let federator = mk_federator(tmp.path());
        let key = federator.create_metric("servers.web01.load").unwrap();
        let reading = MetricReading { metric: key.name.clone(), value: 3.4, time: 92 };
        assert!(federator.unchecked_write(&key, &reading));
        std::thread::sleep(Duration::from_millis(500));

        let res = dispatch(
            &federator,
            "GetRangeData",
            json!({ "Node": "servers.web01.load", "Start": 1, "End": 1000 }),
        )
        .unwrap();
        assert_eq!(res, json!({ "Data": [ { "Timestamp": 60, "Value": 3.4 } ] }));
        federator.release();
    }

    #[test]
    fn unknown_metric_is_an_rpc_error() {
        let tmp = tempfile::tempdir().unwrap();
        let federator = mk_federator(tmp.path());
        let err = dispatch(
            &federator,
            "GetRangeData",
            json!({ "Node": "no.such.metric", "Start": 1, "End": 2 }),
        )
        .unwrap_err();
        assert_eq!(err.0, -32000);
        assert_eq!(err.1, "key not found: no.such.metric");
        federator.release();
    }

    #[test]
    fn unknown_method_and_bad_params() {
        let tmp = tempfile::tempdir().unwrap();
        let federator = mk_federator(tmp.path());
        assert_eq!(dispatch(&federator, "Nope", Value::Null).unwrap_err().0, -32601);
        assert_eq!(dispatch(&federator, "IsNodeLeaf", json!({})).unwrap_err().0, -32602);
        federator.release();
    }

    #[test]
    fn positional_params_unwrap() {
        assert_eq!(unwrap_params(json!([{ "Node": "x" }])), json!({ "Node": "x" }));
        assert_eq!(unwrap_params(json!({ "Node": "x" })), json!({ "Node": "x" }));
        assert_eq!(unwrap_params(Value::Null), Value::Null);
    }
}
