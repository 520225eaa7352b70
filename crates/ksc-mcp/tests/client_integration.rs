//! End-to-end tests for `McpClient` against a scripted in-memory server.
//!
//! The fake server sits on the other end of a `tokio::io::duplex` pipe and
//! answers exactly what each test scripts, so ordering, cancellation, and
//! stream failure can be driven deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ksc_mcp::{
    CallContext, CancelReason, ClientOptions, ClientState, McpClient, McpError, ToolContent,
};
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// FakeServer
// ---------------------------------------------------------------------------

struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    /// Next message the client sent, parsed.
    async fn recv(&mut self) -> Value {
        let line = self
            .lines
            .next_line()
            .await
            .unwrap()
            .expect("client closed its side");
        serde_json::from_str(&line).unwrap()
    }

    /// Next request, asserting its method.
    async fn expect_request(&mut self, method: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["method"], method, "unexpected message: {msg}");
        assert!(msg["id"].is_u64(), "request without numeric id: {msg}");
        msg
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn reply(&mut self, id: &Value, result: Value) {
        let msg = json!({"jsonrpc": "2.0", "id": id, "result": result});
        self.send_raw(&msg.to_string()).await;
    }

    async fn reply_error(&mut self, id: &Value, code: i64, message: &str) {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        });
        self.send_raw(&msg.to_string()).await;
    }

    /// Play the server side of the handshake, offering `tools`.
    async fn handshake(&mut self, tools: Value) {
        let init = self.expect_request("initialize").await;
        assert_eq!(init["params"]["protocolVersion"], "2024-11-05");
        assert_eq!(init["params"]["capabilities"], json!({}));
        assert_eq!(init["params"]["clientInfo"]["name"], "ksc");
        self.reply(
            &init["id"],
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-ops", "version": "0.0.1"}
            }),
        )
        .await;

        let initialized = self.recv().await;
        assert_eq!(initialized["method"], "notifications/initialized");
        assert!(initialized.get("id").is_none());

        let list = self.expect_request("tools/list").await;
        self.reply(&list["id"], json!({"tools": tools})).await;
    }
}

fn pair() -> (McpClient, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    let client = McpClient::with_transport(
        "fake",
        client_read,
        client_write,
        ClientOptions::default(),
    );
    let server = FakeServer {
        lines: BufReader::new(server_read).lines(),
        writer: server_write,
    };
    (client, server)
}

/// Like [`pair`], but with each direction on its own pipe so the test can
/// break the client's output while the server can still talk back. The extra
/// halves keep both pipes open until the test drops them.
fn split_pair() -> (
    McpClient,
    FakeServer,
    WriteHalf<DuplexStream>,
    ReadHalf<DuplexStream>,
) {
    let (client_in, server_out) = tokio::io::duplex(64 * 1024);
    let (client_out, server_in) = tokio::io::duplex(64 * 1024);
    let (server_read, server_in_spare) = tokio::io::split(server_in);
    let (server_out_spare, server_write) = tokio::io::split(server_out);
    let client = McpClient::with_transport("fake", client_in, client_out, ClientOptions::default());
    let server = FakeServer {
        lines: BufReader::new(server_read).lines(),
        writer: server_write,
    };
    (client, server, server_in_spare, server_out_spare)
}

/// Arguments big enough to fill the pipe when the server stops reading.
fn oversized_arguments() -> serde_json::Map<String, Value> {
    let mut args = serde_json::Map::new();
    args.insert("blob".to_string(), json!("x".repeat(256 * 1024)));
    args
}

fn cluster_health_tool() -> Value {
    json!([{
        "name": "get_cluster_health",
        "description": "Summarize health of every managed cluster",
        "inputSchema": {"type": "object", "properties": {}}
    }])
}

/// A client that has completed the handshake, plus its server.
async fn ready_pair(tools: Value) -> (Arc<McpClient>, FakeServer) {
    let (client, mut server) = pair();
    let ctx = CallContext::new();
    let (started, ()) = tokio::join!(client.start(&ctx), server.handshake(tools));
    started.unwrap();
    assert_eq!(client.state(), ClientState::Ready);
    (Arc::new(client), server)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_discovers_single_tool() {
    let (client, _server) = ready_pair(cluster_health_tool()).await;

    let tools = client.tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "get_cluster_health");
    assert_eq!(tools[0].input_schema.schema_type, "object");

    let info = client.server_info().unwrap();
    assert_eq!(info.protocol_version, "2024-11-05");
    assert_eq!(info.server_info.name, "fake-ops");
}

#[tokio::test]
async fn handshake_failure_is_combined_and_closes_client() {
    let (client, mut server) = pair();
    let server_side = async {
        let init = server.expect_request("initialize").await;
        server.reply(&init["id"], json!({"protocolVersion": "2024-11-05"})).await;
        let _initialized = server.recv().await;
        let list = server.expect_request("tools/list").await;
        server.reply_error(&list["id"], -32603, "catalog unavailable").await;
    };
    let ctx = CallContext::new();
    let (started, ()) = tokio::join!(client.start(&ctx), server_side);

    match started {
        Err(McpError::Handshake { stage, source, .. }) => {
            assert_eq!(stage, "tools/list");
            assert!(matches!(*source, McpError::JsonRpc { code: -32603, .. }));
        }
        other => panic!("Expected Handshake error, got: {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Closed);
    assert!(client.tools().is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (client, _server) = ready_pair(cluster_health_tool()).await;
    assert!(matches!(
        client.start(&CallContext::new()).await,
        Err(McpError::AlreadyStarted { .. })
    ));
    assert_eq!(client.state(), ClientState::Ready);
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_tool_returns_text_content() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call_tool("get_cluster_health", serde_json::Map::new(), &CallContext::new())
                .await
        })
    };

    let req = server.expect_request("tools/call").await;
    assert_eq!(req["params"]["name"], "get_cluster_health");
    assert_eq!(req["params"]["arguments"], json!({}));
    server
        .reply(&req["id"], json!({"content": [{"type": "text", "text": "ok"}], "isError": false}))
        .await;

    let content = call.await.unwrap().unwrap();
    assert_eq!(content, vec![ToolContent::Text { text: "ok".into() }]);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn tool_error_carries_content() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call_tool("get_cluster_health", serde_json::Map::new(), &CallContext::new())
                .await
        })
    };
    let req = server.expect_request("tools/call").await;
    server
        .reply(
            &req["id"],
            json!({"content": [{"type": "text", "text": "kubeconfig not found"}], "isError": true}),
        )
        .await;

    match call.await.unwrap() {
        Err(McpError::ToolFailed { tool, content, .. }) => {
            assert_eq!(tool, "get_cluster_health");
            assert_eq!(content[0].as_text(), Some("kubeconfig not found"));
        }
        other => panic!("Expected ToolFailed, got: {other:?}"),
    }
}

#[tokio::test]
async fn missing_required_argument_is_rejected_locally() {
    let tools = json!([{
        "name": "get_pods",
        "inputSchema": {
            "type": "object",
            "properties": {"namespace": {"type": "string"}},
            "required": ["namespace"]
        }
    }]);
    let (client, _server) = ready_pair(tools).await;

    match client
        .call_tool("get_pods", serde_json::Map::new(), &CallContext::new())
        .await
    {
        Err(McpError::InvalidArguments { tool, missing }) => {
            assert_eq!(tool, "get_pods");
            assert_eq!(missing, vec!["namespace"]);
        }
        other => panic!("Expected InvalidArguments, got: {other:?}"),
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn rpc_error_reaches_only_its_caller() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let failing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("nope/missing", None, &CallContext::new()).await })
    };
    let first = server.expect_request("nope/missing").await;

    let succeeding = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/echo", None, &CallContext::new()).await })
    };
    let second = server.expect_request("test/echo").await;

    server.reply_error(&first["id"], -32601, "Method not found").await;
    server.reply(&second["id"], json!({"echo": true})).await;

    match failing.await.unwrap() {
        Err(McpError::JsonRpc { code, message, .. }) => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("Expected JsonRpc error, got: {other:?}"),
    }
    assert_eq!(succeeding.await.unwrap().unwrap(), json!({"echo": true}));
    assert_eq!(client.state(), ClientState::Ready);
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_calls_get_their_own_replies_in_reverse_order() {
    const N: usize = 16;
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let mut calls = Vec::new();
    for i in 0..N {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            let result = client
                .call("test/echo", Some(json!({"caller": i})), &CallContext::new())
                .await
                .unwrap();
            (i, result)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..N {
        requests.push(server.expect_request("test/echo").await);
    }
    let ids: std::collections::HashSet<u64> =
        requests.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids.len(), N);

    for req in requests.iter().rev() {
        server.reply(&req["id"], json!({"caller": req["params"]["caller"]})).await;
    }

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result["caller"], i);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn malformed_line_between_responses_is_ignored() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let a = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/a", None, &CallContext::new()).await })
    };
    let req_a = server.expect_request("test/a").await;
    let b = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/b", None, &CallContext::new()).await })
    };
    let req_b = server.expect_request("test/b").await;

    server.reply(&req_a["id"], json!("first")).await;
    server.send_raw("{this is not json").await;
    server.send_raw(r#"{"jsonrpc":"2.0","id":99999,"result":"stray"}"#).await;
    server.reply(&req_b["id"], json!("second")).await;

    assert_eq!(a.await.unwrap().unwrap(), json!("first"));
    assert_eq!(b.await.unwrap().unwrap(), json!("second"));
    assert_eq!(client.state(), ClientState::Ready);
}

// ---------------------------------------------------------------------------
// Cancellation and deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deadline_cancels_unanswered_tool_call() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;
    let baseline = client.pending_calls();

    let started = Instant::now();
    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
            client
                .call_tool("get_cluster_health", serde_json::Map::new(), &ctx)
                .await
        })
    };
    let _req = server.expect_request("tools/call").await;

    let result = call.await.unwrap();
    let elapsed = started.elapsed();
    match result {
        Err(e @ McpError::Cancelled { .. }) => assert!(e.is_cancelled()),
        other => panic!("Expected Cancelled, got: {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(client.pending_calls(), baseline);
}

#[tokio::test]
async fn deadline_covers_write_to_stalled_server() {
    // The server never reads again, so the request cannot be fully written.
    let (client, _server) = ready_pair(cluster_health_tool()).await;

    let started = Instant::now();
    let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.call_tool("get_cluster_health", oversized_arguments(), &ctx),
    )
    .await
    .expect("caller stuck behind a blocked write");

    match result {
        Err(McpError::Cancelled {
            reason: CancelReason::DeadlineElapsed { timeout_ms },
            ..
        }) => assert_eq!(timeout_ms, 50),
        other => panic!("Expected deadline, got: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn cancel_token_covers_write_to_stalled_server() {
    let (client, _server) = ready_pair(cluster_health_tool()).await;
    let token = CancellationToken::new();

    let blocked = {
        let client = Arc::clone(&client);
        let ctx = CallContext::new().with_cancel(token.clone());
        tokio::spawn(async move {
            client
                .call_tool("get_cluster_health", oversized_arguments(), &ctx)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("cancel did not release the caller")
        .unwrap();
    match result {
        Err(McpError::Cancelled { reason, .. }) => assert_eq!(reason, CancelReason::Requested),
        other => panic!("Expected Cancelled, got: {other:?}"),
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn cancelled_call_ignores_late_response() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;
    let token = CancellationToken::new();

    let call = {
        let client = Arc::clone(&client);
        let ctx = CallContext::new().with_cancel(token.clone());
        tokio::spawn(async move { client.call("test/slow", None, &ctx).await })
    };
    let req = server.expect_request("test/slow").await;
    assert_eq!(client.pending_calls(), 1);

    token.cancel();
    match call.await.unwrap() {
        Err(McpError::Cancelled { method, .. }) => assert_eq!(method, "test/slow"),
        other => panic!("Expected Cancelled, got: {other:?}"),
    }
    assert_eq!(client.pending_calls(), 0);

    // The late reply is dropped and the session carries on.
    server.reply(&req["id"], json!("too late")).await;
    let next = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/next", None, &CallContext::new()).await })
    };
    let req = server.expect_request("test/next").await;
    server.reply(&req["id"], json!("fresh")).await;
    assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn pre_cancelled_call_sends_nothing() {
    let (client, _server) = ready_pair(cluster_health_tool()).await;
    let token = CancellationToken::new();
    token.cancel();
    let ctx = CallContext::new().with_cancel(token);
    assert!(matches!(
        client.call("test/never", None, &ctx).await,
        Err(McpError::Cancelled { .. })
    ));
    assert_eq!(client.pending_calls(), 0);
}

// ---------------------------------------------------------------------------
// Stream failure and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_eof_releases_pending_callers() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/hang", None, &CallContext::new()).await })
    };
    let _req = server.expect_request("test/hang").await;
    drop(server);

    match call.await.unwrap() {
        Err(McpError::Closed { reason, .. }) => assert_eq!(reason, "server closed its output"),
        other => panic!("Expected Closed, got: {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.pending_calls(), 0);

    assert!(matches!(
        client.call("test/after", None, &CallContext::new()).await,
        Err(McpError::Closed { .. })
    ));
}

#[tokio::test]
async fn stop_releases_pending_callers_and_is_idempotent() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("test/hang", None, &CallContext::new()).await })
    };
    let _req = server.expect_request("test/hang").await;

    client.stop().await;
    client.stop().await;
    assert!(matches!(call.await.unwrap(), Err(McpError::Closed { .. })));
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn stop_does_not_wait_for_blocked_write() {
    let (client, _server) = ready_pair(cluster_health_tool()).await;

    let blocked = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call_tool("get_cluster_health", oversized_arguments(), &CallContext::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), client.stop())
        .await
        .expect("stop hung behind a blocked write");
    assert_eq!(client.state(), ClientState::Closed);

    let result = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked caller was not released")
        .unwrap();
    assert!(
        matches!(
            result,
            Err(McpError::Closed { .. }) | Err(McpError::Transport { .. })
        ),
        "got: {result:?}"
    );
}

#[tokio::test]
async fn write_failure_closes_client() {
    let (client, mut server, server_in_spare, _server_out_spare) = split_pair();
    let ctx = CallContext::new();
    let (started, ()) = tokio::join!(client.start(&ctx), server.handshake(cluster_health_tool()));
    started.unwrap();

    // Close the pipe the client writes into; its output side stays open.
    let FakeServer { lines, writer: _writer } = server;
    drop(lines);
    drop(server_in_spare);

    match client.call("test/after-break", None, &CallContext::new()).await {
        Err(McpError::Transport { server, .. }) => assert_eq!(server, "fake"),
        other => panic!("Expected Transport, got: {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.pending_calls(), 0);

    match client.call("test/again", None, &CallContext::new()).await {
        Err(McpError::Closed { reason, .. }) => {
            assert!(reason.contains("writing to server failed"), "reason: {reason}")
        }
        other => panic!("Expected Closed, got: {other:?}"),
    }
}

#[tokio::test]
async fn sequential_calls_use_strictly_increasing_ids() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;

    let mut last = 0;
    for i in 0..10_000u64 {
        let ctx = CallContext::new();
        let (result, id) = tokio::join!(client.call("test/echo", None, &ctx), async {
            let req = server.expect_request("test/echo").await;
            server.reply(&req["id"], json!(i)).await;
            req["id"].as_u64().unwrap()
        });
        assert_eq!(result.unwrap(), json!(i));
        assert!(id > last, "id {id} after {last}");
        last = id;
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn server_ping_is_answered() {
    let (_client, mut server) = ready_pair(cluster_health_tool()).await;

    server.send_raw(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).await;
    let pong = server.recv().await;
    assert_eq!(pong["id"], "srv-1");
    assert_eq!(pong["result"], json!({}));

    server.send_raw(r#"{"jsonrpc":"2.0","id":"srv-2","method":"sampling/createMessage"}"#).await;
    let refusal = server.recv().await;
    assert_eq!(refusal["id"], "srv-2");
    assert_eq!(refusal["error"]["code"], -32601);
}

#[tokio::test]
async fn notify_writes_message_without_id() {
    let (client, mut server) = ready_pair(cluster_health_tool()).await;
    client
        .notify("notifications/cancelled", Some(json!({"requestId": 3})))
        .await
        .unwrap();
    let msg = server.recv().await;
    assert_eq!(msg["method"], "notifications/cancelled");
    assert!(msg.get("id").is_none());
    assert_eq!(msg["params"]["requestId"], 3);
    assert_eq!(client.pending_calls(), 0);
}
