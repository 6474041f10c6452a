//! End-to-end protocol tests over an in-process server
//!
//! Drives the MCP method layer and the stdio framing loop against a
//! scripted search backend and scripted intel sources, without a live
//! cluster.

use async_trait::async_trait;
use dshield_core::{AppConfig, DshieldResult, SourceResult, ThreatSource};
use dshield_intel::{IntelSource, ThreatIntelManager};
use dshield_server::auth::Authenticator;
use dshield_server::mcp::{self, Session};
use dshield_server::rpc::{self, JsonRpcRequest, JsonRpcResponse};
use dshield_server::state::ServerState;
use dshield_server::tools::ToolRegistry;
use dshield_server::transport::StdioTransport;
use dshield_siem::{SearchBackend, SiemEngine};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scripted cluster: pops canned search responses in order.
struct ScriptedBackend {
    responses: Mutex<Vec<Value>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn search(&self, _: &[String], _: &Value) -> DshieldResult<Value> {
        let mut responses = self.responses.lock().expect("lock");
        if responses.is_empty() {
            Ok(json!({ "hits": { "total": { "value": 0 }, "hits": [] } }))
        } else {
            Ok(responses.remove(0))
        }
    }
    async fn count(&self, _: &[String], _: &Value) -> DshieldResult<u64> {
        Ok(10)
    }
    async fn list_indices(&self) -> DshieldResult<Vec<String>> {
        Ok(vec!["dshield-2025.01".to_string()])
    }
    async fn get_mapping(&self, _: &str) -> DshieldResult<Value> {
        Ok(json!({}))
    }
    async fn cluster_health(&self) -> DshieldResult<Value> {
        Ok(json!({ "status": "green" }))
    }
    async fn cluster_stats(&self) -> DshieldResult<Value> {
        Ok(json!({}))
    }
    async fn index_document(&self, _: &str, _: &str, _: &Value) -> DshieldResult<()> {
        Ok(())
    }
}

struct ScriptedIntel {
    source: ThreatSource,
    result: SourceResult,
}

#[async_trait]
impl IntelSource for ScriptedIntel {
    fn name(&self) -> ThreatSource {
        self.source
    }
    fn reliability(&self) -> f64 {
        self.source.default_reliability()
    }
    async fn ip_reputation(&self, _: &str) -> DshieldResult<SourceResult> {
        Ok(self.result.clone())
    }
}

fn test_config() -> AppConfig {
    serde_yaml::from_str(
        r#"
elasticsearch:
  url: "http://localhost:9200"
"#,
    )
    .expect("test config should parse")
}

fn event_hit(id: &str, millis: i64, source_ip: &str) -> Value {
    let ts = chrono::DateTime::from_timestamp_millis(millis)
        .expect("valid millis")
        .to_rfc3339();
    json!({
        "_id": id,
        "_source": {
            "@timestamp": ts,
            "source": { "ip": source_ip },
            "destination": { "ip": "198.51.100.1" },
            "event": { "category": "network" }
        },
        "sort": [millis, id]
    })
}

fn build_state(responses: Vec<Value>, cache_dir: &TempDir) -> Arc<ServerState> {
    let config = test_config();
    let backend: Arc<dyn SearchBackend> = Arc::new(ScriptedBackend::new(responses));
    let siem = SiemEngine::new(
        backend,
        config.query.clone(),
        config.elasticsearch.index_patterns.clone(),
        config.elasticsearch.fallback_indices.clone(),
    );

    let cache = Arc::new(
        dshield_cache::TieredCache::open(&dshield_cache::CacheSettings {
            directory: cache_dir.path().to_path_buf(),
            max_disk_mb: 10,
            ..Default::default()
        })
        .expect("cache should open"),
    );

    let registry: Vec<Arc<dyn IntelSource>> = vec![
        Arc::new(ScriptedIntel {
            source: ThreatSource::Virustotal,
            result: SourceResult {
                threat_score: Some(80.0),
                ..Default::default()
            },
        }),
        Arc::new(ScriptedIntel {
            source: ThreatSource::Shodan,
            result: SourceResult {
                threat_score: Some(60.0),
                ..Default::default()
            },
        }),
    ];
    let intel = ThreatIntelManager::new(&config.threat_intelligence, registry, cache, None);

    Arc::new(ServerState::new(config, siem, intel))
}

struct Harness {
    state: Arc<ServerState>,
    registry: ToolRegistry,
    authenticator: Authenticator,
}

impl Harness {
    fn new(responses: Vec<Value>, cache_dir: &TempDir) -> Self {
        let state = build_state(responses, cache_dir);
        let registry =
            ToolRegistry::new(&state.config.error_handling.timeouts).expect("registry builds");
        Self {
            state,
            registry,
            authenticator: Authenticator::from_config(&[]),
        }
    }

    async fn call(&self, session: &mut Session, id: i64, method: &str, params: Value) -> JsonRpcResponse {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        };
        mcp::handle_request(&self.state, &self.registry, &self.authenticator, session, request)
            .await
            .expect("request expects a response")
    }

    async fn call_tool(&self, session: &mut Session, name: &str, arguments: Value) -> JsonRpcResponse {
        self.call(
            session,
            1,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }
}

/// Extract the JSON payload from a successful tool response.
fn tool_payload(response: &JsonRpcResponse) -> Value {
    let result = response
        .result
        .as_ref()
        .unwrap_or_else(|| panic!("expected success, got {:?}", response.error));
    let text = result["content"][0]["text"].as_str().expect("text part expected");
    serde_json::from_str(text).expect("payload should be JSON")
}

#[tokio::test]
async fn test_initialize_and_tools_list() {
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![], &dir);
    let mut session = Session::local();

    let response = harness.call(&mut session, 1, "initialize", json!({})).await;
    let result = response.result.expect("initialize should succeed");
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "DShield MCP Server");

    let response = harness.call(&mut session, 2, "tools/list", json!({})).await;
    let tools = response.result.expect("tools/list should succeed");
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .map(|t| t["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names.len(), 15);
    for expected in [
        "query_dshield_events",
        "stream_dshield_events_with_session_context",
        "enrich_ip_comprehensive",
        "diagnose_data_availability",
        "health_check",
    ] {
        assert!(names.contains(&expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_page_based_recent_events() {
    let response = json!({
        "hits": {
            "total": { "value": 4 },
            "hits": (0..4).map(|i| event_hit(&format!("e{}", i), 1_735_689_600_000 - i * 1000, "192.0.2.10")).collect::<Vec<_>>()
        }
    });
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![response], &dir);
    let mut session = Session::local();

    let reply = harness
        .call_tool(
            &mut session,
            "query_dshield_events",
            json!({
                "time_range_hours": 1,
                "page": 1,
                "page_size": 10,
                "filters": { "source_ip": "192.0.2.10" }
            }),
        )
        .await;

    let payload = tool_payload(&reply);
    let events = payload["events"].as_array().expect("events array");
    assert!(events.len() <= 10);
    assert!(events
        .iter()
        .all(|e| e["source_ip"] == "192.0.2.10"));

    let pagination = &payload["pagination"];
    assert_eq!(pagination["current_page"], 1);
    assert_eq!(pagination["page_size"], 10);
    assert_eq!(pagination["start_index"], 1);
    assert_eq!(pagination["end_index"], 4);
}

#[tokio::test]
async fn test_cursor_streaming_two_chunks_no_duplicates() {
    let base = 1_735_689_600_000i64;
    let first = json!({
        "hits": {
            "total": { "value": 6 },
            "hits": (0..3).map(|i| event_hit(&format!("s{}", i), base - i * 1000, "192.0.2.1")).collect::<Vec<_>>()
        }
    });
    let second = json!({
        "hits": {
            "total": { "value": 6 },
            "hits": (3..6).map(|i| event_hit(&format!("s{}", i), base - i * 1000, "192.0.2.1")).collect::<Vec<_>>()
        }
    });
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![first, second], &dir);
    let mut session = Session::local();

    let reply = harness
        .call_tool(&mut session, "stream_dshield_events", json!({ "chunk_size": 3 }))
        .await;
    let chunk1 = tool_payload(&reply);
    assert_eq!(chunk1["events"].as_array().expect("events").len(), 3);
    let cursor = chunk1["next_cursor"].as_str().expect("cursor expected").to_string();

    let reply = harness
        .call_tool(
            &mut session,
            "stream_dshield_events",
            json!({ "chunk_size": 3, "cursor": cursor }),
        )
        .await;
    let chunk2 = tool_payload(&reply);

    let mut ids: Vec<String> = chunk1["events"]
        .as_array()
        .expect("events")
        .iter()
        .chain(chunk2["events"].as_array().expect("events"))
        .map(|e| e["id"].as_str().expect("id").to_string())
        .collect();
    assert_eq!(ids.len(), 6);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6, "chunks must not overlap");
}

#[tokio::test]
async fn test_aggregation_fallback_tool_response() {
    let agg_response = json!({
        "hits": { "total": { "value": 500000 }, "hits": [] },
        "aggregations": {
            "top_sources": { "buckets": [ { "key": "192.0.2.1", "doc_count": 300000 } ] },
            "top_destinations": { "buckets": [ { "key": 22, "doc_count": 400000 } ] },
            "event_categories": { "buckets": [ { "key": "network", "doc_count": 500000 } ] },
            "timeline": { "buckets": [] }
        }
    });
    let dir = TempDir::new().expect("temp dir");
    // The scripted count (10) is irrelevant here: the tiny budget forces
    // degradation because the estimator uses min(count, page_size)
    let harness = Harness::new(vec![agg_response], &dir);
    let mut session = Session::local();

    let reply = harness
        .call_tool(
            &mut session,
            "query_dshield_events",
            json!({
                "time_range_hours": 720,
                "max_result_size_mb": 0.01,
                "fallback_strategy": "aggregate"
            }),
        )
        .await;

    let payload = tool_payload(&reply);
    let events = payload["events"].as_array().expect("events");
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e["event_type"] == "aggregation"));
    assert_eq!(payload["pagination"]["fallback_strategy"], "aggregate");
    assert_eq!(payload["total_count"], 500000);
}

#[tokio::test]
async fn test_ip_enrichment_weighted_and_cached() {
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![], &dir);
    let mut session = Session::local();

    let reply = harness
        .call_tool(
            &mut session,
            "enrich_ip_comprehensive",
            json!({ "ip_address": "8.8.8.8" }),
        )
        .await;
    let first = tool_payload(&reply);
    let score = first["overall_threat_score"].as_f64().expect("score");
    assert!((score - 71.25).abs() < 0.01);
    assert_eq!(first["cache_hit"], false);

    let reply = harness
        .call_tool(
            &mut session,
            "enrich_ip_comprehensive",
            json!({ "ip_address": "8.8.8.8" }),
        )
        .await;
    let second = tool_payload(&reply);
    assert_eq!(second["cache_hit"], true);

    // Byte-identical modulo the cache-hit flag
    let mut normalized = second.clone();
    normalized["cache_hit"] = json!(false);
    assert_eq!(normalized, first);
}

#[tokio::test]
async fn test_unknown_tool_and_invalid_params() {
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![], &dir);
    let mut session = Session::local();

    let reply = harness.call_tool(&mut session, "no_such_tool", json!({})).await;
    assert_eq!(reply.error.expect("error expected").code, -32601);

    let reply = harness
        .call_tool(&mut session, "query_dshield_events", json!({ "page_size": 0 }))
        .await;
    assert_eq!(reply.error.expect("error expected").code, -32602);

    let reply = harness
        .call_tool(
            &mut session,
            "enrich_ip_comprehensive",
            json!({ "ip_address": "not-an-ip" }),
        )
        .await;
    assert_eq!(reply.error.expect("error expected").code, -32602);
}

#[tokio::test]
async fn test_network_session_requires_authentication() {
    use dshield_core::ApiKeyConfig;
    use secrecy::SecretString;

    let dir = TempDir::new().expect("temp dir");
    let mut harness = Harness::new(vec![], &dir);
    harness.authenticator = Authenticator::from_config(&[ApiKeyConfig {
        key: SecretString::new("test-key".to_string().into()),
        permissions: vec!["read".to_string(), "enrich".to_string(), "diagnostics".to_string()],
        expires_at: None,
    }]);

    let mut session = Session::network(true);

    // Any call before authenticate fails with the dedicated error
    let reply = harness.call(&mut session, 1, "tools/list", json!({})).await;
    let error = reply.error.expect("error expected");
    assert_eq!(error.code, -32600);
    assert!(error.message.contains("Authentication required"));

    // Wrong key is rejected and the session stays unauthenticated
    let reply = harness
        .call(&mut session, 2, "authenticate", json!({ "api_key": "wrong" }))
        .await;
    assert!(reply.error.is_some());
    assert!(!session.authenticated);

    // Correct key authenticates and unlocks tool calls
    let reply = harness
        .call(&mut session, 3, "authenticate", json!({ "api_key": "test-key" }))
        .await;
    assert_eq!(reply.result.expect("result")["authenticated"], true);

    let reply = harness.call(&mut session, 4, "tools/list", json!({})).await;
    assert!(reply.result.is_some());
}

#[tokio::test]
async fn test_permission_binding_limits_tools() {
    use dshield_core::ApiKeyConfig;
    use secrecy::SecretString;

    let dir = TempDir::new().expect("temp dir");
    let mut harness = Harness::new(vec![], &dir);
    harness.authenticator = Authenticator::from_config(&[ApiKeyConfig {
        key: SecretString::new("read-only".to_string().into()),
        permissions: vec!["read".to_string()],
        expires_at: None,
    }]);

    let mut session = Session::network(true);
    harness
        .call(&mut session, 1, "authenticate", json!({ "api_key": "read-only" }))
        .await;

    // Read tools work
    let reply = harness
        .call_tool(&mut session, "get_dshield_statistics", json!({}))
        .await;
    assert!(reply.result.is_some());

    // Enrichment is denied for a read-only key
    let reply = harness
        .call_tool(
            &mut session,
            "enrich_ip_comprehensive",
            json!({ "ip_address": "8.8.8.8" }),
        )
        .await;
    assert!(reply.error.is_some());
}

#[tokio::test]
async fn test_health_check_tool() {
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![], &dir);
    let mut session = Session::local();

    let reply = harness.call_tool(&mut session, "health_check", json!({})).await;
    let payload = tool_payload(&reply);

    let healthy = payload["healthy_services"].as_array().expect("healthy services");
    assert!(healthy.iter().any(|s| s == "elasticsearch"));
    assert!(healthy.iter().any(|s| s == "cache_database"));
    let overall = payload["overall_health"].as_f64().expect("overall health");
    assert!((0.0..=1.0).contains(&overall));
}

#[tokio::test]
async fn test_diagnose_empty_cluster_over_rpc() {
    struct EmptyBackend;

    #[async_trait]
    impl SearchBackend for EmptyBackend {
        async fn search(&self, _: &[String], _: &Value) -> DshieldResult<Value> {
            Ok(json!({ "hits": { "total": { "value": 0 }, "hits": [] } }))
        }
        async fn count(&self, _: &[String], _: &Value) -> DshieldResult<u64> {
            Ok(0)
        }
        async fn list_indices(&self) -> DshieldResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_mapping(&self, _: &str) -> DshieldResult<Value> {
            Ok(json!({}))
        }
        async fn cluster_health(&self) -> DshieldResult<Value> {
            Ok(json!({}))
        }
        async fn cluster_stats(&self) -> DshieldResult<Value> {
            Ok(json!({}))
        }
        async fn index_document(&self, _: &str, _: &str, _: &Value) -> DshieldResult<()> {
            Ok(())
        }
    }

    let dir = TempDir::new().expect("temp dir");
    let config = test_config();
    let backend: Arc<dyn SearchBackend> = Arc::new(EmptyBackend);
    let siem = SiemEngine::new(
        backend,
        config.query.clone(),
        config.elasticsearch.index_patterns.clone(),
        config.elasticsearch.fallback_indices.clone(),
    );
    let cache = Arc::new(
        dshield_cache::TieredCache::open(&dshield_cache::CacheSettings {
            directory: dir.path().to_path_buf(),
            max_disk_mb: 10,
            ..Default::default()
        })
        .expect("cache should open"),
    );
    let intel = ThreatIntelManager::new(
        &config.threat_intelligence,
        vec![Arc::new(ScriptedIntel {
            source: ThreatSource::Dshield,
            result: SourceResult::default(),
        }) as Arc<dyn IntelSource>],
        cache,
        None,
    );
    let state = Arc::new(ServerState::new(config, siem, intel));
    let registry = ToolRegistry::new(&state.config.error_handling.timeouts).expect("registry");
    let authenticator = Authenticator::from_config(&[]);
    let mut session = Session::local();

    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(1)),
        method: "tools/call".to_string(),
        params: json!({ "name": "diagnose_data_availability", "arguments": {} }),
    };
    let reply = mcp::handle_request(&state, &registry, &authenticator, &mut session, request)
        .await
        .expect("response expected");

    let payload = tool_payload(&reply);
    assert!(payload["overall_status"]
        .as_str()
        .expect("status")
        .contains("issues_detected"));
    assert_eq!(payload["severity"], "high");
    let pattern_recommendations = payload["recommendations"]
        .as_array()
        .expect("recommendations")
        .iter()
        .filter(|r| r.as_str().unwrap_or_default().contains("index_patterns"))
        .count();
    assert!(pattern_recommendations >= 2);
}

#[tokio::test]
async fn test_stdio_transport_framing_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let harness = Harness::new(vec![], &dir);
    let transport = StdioTransport::new(
        harness.state.clone(),
        Arc::new(ToolRegistry::new(&harness.state.config.error_handling.timeouts).expect("registry")),
        Arc::new(Authenticator::from_config(&[])),
    );

    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = tokio::spawn(async move {
        let _ = transport.serve(server_read, server_write, shutdown_rx).await;
    });

    let request = serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/list"
    }))
    .expect("serialize");
    rpc::write_frame(&mut client, &request).await.expect("write");

    let frame = rpc::read_frame(&mut client, 1024 * 1024)
        .await
        .expect("read")
        .expect("frame expected");
    let response: JsonRpcResponse = serde_json::from_slice(&frame).expect("parse");
    assert!(response.result.is_some());

    // A malformed payload earns a parse error with a null id
    rpc::write_frame(&mut client, b"{not json").await.expect("write");
    let frame = rpc::read_frame(&mut client, 1024 * 1024)
        .await
        .expect("read")
        .expect("frame expected");
    let response: JsonRpcResponse = serde_json::from_slice(&frame).expect("parse");
    assert_eq!(response.error.expect("error").code, -32700);
    assert_eq!(response.id, Value::Null);

    drop(client);
    let _ = server.await;
}
