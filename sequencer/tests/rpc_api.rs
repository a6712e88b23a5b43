// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use app_core::chain::{DevChain, dev_transaction};
use app_core::message::{L1IncomingMessage, L1IncomingMessageHeader, L1MessageKind};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use sequencer::api::router;
use sequencer::coordinator::{CoordinatorConfig, SequencingCoordinator};
use sequencer::driver::{DriverConfig, DriverError, SequencingDriver};
use sequencer::sequencer_state::SequencerState;
use sequencer::tx_queue::{TransactionQueue, TransactionQueueConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_raw_transaction_is_refused_while_inactive() {
    let Some(runtime) = start_server().await else {
        return;
    };

    let tx = dev_transaction(Address::repeat_byte(1), 0, b"inactive");
    let (status, body) = rpc(runtime.addr, "eth_sendRawTransaction", json!([tx.raw_hex()])).await;
    assert_eq!(status, 200);
    assert_eq!(body["error"]["code"], json!(-32000));
    assert_eq!(body["error"]["message"], json!("sequencer not available"));
    assert_eq!(runtime.coordinator.tx_queue().queue_len(), 0);

    shutdown(runtime).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consensus_driven_cycle_over_rpc() {
    let Some(runtime) = start_server().await else {
        return;
    };
    let addr = runtime.addr;

    let (_, body) = rpc(addr, "sequencer_activate", json!([])).await;
    assert_eq!(body["result"], json!("OK"));

    let tx = dev_transaction(Address::repeat_byte(2), 0, b"over rpc");
    let raw_hex = tx.raw_hex();
    let submit = tokio::spawn(async move {
        rpc_with_timeout(addr, "eth_sendRawTransaction", json!([raw_hex]), Duration::from_secs(10))
            .await
    });

    let sequenced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, body) = rpc(addr, "sequencer_startSequencing", json!([])).await;
            let result = &body["result"];
            if !result["sequencedMsg"].is_null() {
                return result["sequencedMsg"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for a sequenced block");
    assert_eq!(sequenced["msgIdx"], json!(1));

    // The cycle is still open until append / end.
    let (_, body) = rpc(addr, "sequencer_startSequencing", json!([])).await;
    assert_eq!(body["error"]["message"], json!("mutex held"));

    let (_, body) = rpc(addr, "sequencer_appendLastSequencedBlock", json!([])).await;
    assert_eq!(body["result"], json!("OK"));
    let (_, body) = rpc(addr, "sequencer_endSequencing", json!([null])).await;
    assert_eq!(body["result"], json!("OK"));

    let (status, body) = submit.await.expect("join submit task");
    assert_eq!(status, 200);
    assert_eq!(body["result"], json!(tx.hash()));
    assert!(runtime.coordinator.l1_price_cache().get(1).is_some());

    shutdown(runtime).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delayed_messages_over_rpc() {
    let Some(runtime) = start_server().await else {
        return;
    };
    let addr = runtime.addr;

    let (_, body) = rpc(addr, "sequencer_nextDelayedMessageNumber", json!([])).await;
    assert_eq!(body["result"], json!(0));

    let messages = vec![deposit(0), deposit(1)];
    let (_, body) = rpc(
        addr,
        "sequencer_enqueueDelayedMessages",
        json!([{ "messages": messages, "firstMsgIdx": 0 }]),
    )
    .await;
    assert_eq!(body["result"], json!("OK"));

    let (_, body) = rpc(addr, "sequencer_nextDelayedMessageNumber", json!([])).await;
    assert_eq!(body["result"], json!(2));

    // Inactive: nothing is sequenced and the short backoff is reported.
    let (_, body) = rpc(addr, "sequencer_startSequencing", json!([])).await;
    assert_eq!(body["result"]["sequencedMsg"], Value::Null);
    assert_eq!(body["result"]["waitDurationMs"], json!(50));

    rpc(addr, "sequencer_activate", json!([])).await;
    let (_, body) = rpc(addr, "sequencer_startSequencing", json!([])).await;
    let msg = &body["result"]["sequencedMsg"];
    assert_eq!(msg["msgWithMeta"]["delayedMessagesRead"], json!(1));
    let (_, body) = rpc(addr, "sequencer_endSequencing", json!([])).await;
    assert_eq!(body["result"], json!("OK"));

    let (_, body) = rpc(addr, "sequencer_markFeedStart", json!([1])).await;
    assert_eq!(body["result"], json!("OK"));

    shutdown(runtime).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_requests_map_to_json_rpc_errors() {
    let Some(runtime) = start_server().await else {
        return;
    };
    let addr = runtime.addr;

    let (status, body) = post_json(addr, "/", "{not json".to_string()).await;
    assert_eq!(status, 400);
    let body: Value = serde_json::from_str(&body).expect("json error body");
    assert_eq!(body["error"]["code"], json!(-32700));

    let (status, body) = rpc(addr, "sequencer_doesNotExist", json!([])).await;
    assert_eq!(status, 200);
    assert_eq!(body["error"]["code"], json!(-32601));

    let (_, body) = rpc(addr, "sequencer_forwardTo", json!([])).await;
    assert_eq!(body["error"]["code"], json!(-32602));

    let (_, body) = rpc(addr, "sequencer_forwardTo", json!(["not a url"])).await;
    assert_eq!(body["error"]["code"], json!(-32000));

    let (_, body) = rpc(addr, "eth_sendRawTransaction", json!(["deadbeef"])).await;
    assert_eq!(body["error"]["code"], json!(-32602));

    shutdown(runtime).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_driven_sequencer_answers_submissions() {
    let Some(runtime) = start_server().await else {
        return;
    };
    let addr = runtime.addr;
    runtime.coordinator.activate();

    let (driver_handle, driver_stop) = SequencingDriver::new(
        Arc::clone(&runtime.coordinator),
        DriverConfig {
            error_backoff: Duration::from_millis(5),
            max_consecutive_errors: 10,
        },
    )
    .spawn();

    let sender = Address::repeat_byte(9);
    for nonce in 0..3 {
        let tx = dev_transaction(sender, nonce, b"driven");
        let (_, body) = rpc_with_timeout(
            addr,
            "eth_sendRawTransaction",
            json!([tx.raw_hex()]),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(body["result"], json!(tx.hash()), "nonce {nonce}: {body}");
    }
    assert_eq!(runtime.coordinator.chain().height(), 3);

    driver_stop.request_shutdown();
    let exit = tokio::time::timeout(Duration::from_secs(3), driver_handle)
        .await
        .expect("wait for driver")
        .expect("join driver");
    assert!(matches!(exit, DriverError::ShutdownRequested), "got {exit}");

    shutdown(runtime).await;
}

struct ServerRuntime {
    addr: std::net::SocketAddr,
    coordinator: Arc<SequencingCoordinator<DevChain>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.server_task.take() {
            task.abort();
        }
    }
}

async fn start_server() -> Option<ServerRuntime> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(value) => value,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping rpc integration test: cannot bind test listener in this environment");
            return None;
        }
        Err(err) => panic!("bind test listener: {err}"),
    };
    let addr = listener.local_addr().expect("read listener addr");

    let queue = Arc::new(TransactionQueue::new(TransactionQueueConfig {
        max_queue_size: 128,
        queue_timeout: Duration::from_secs(5),
        max_tx_data_size: 4096,
    }));
    let coordinator = Arc::new(SequencingCoordinator::new(
        Arc::new(DevChain::default()),
        queue,
        SequencerState::default(),
        CoordinatorConfig::default(),
    ));
    let app = router(Arc::clone(&coordinator), 128 * 1024);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let server_task = tokio::spawn(async move {
        server.await.expect("run test server");
    });

    Some(ServerRuntime {
        addr,
        coordinator,
        shutdown_tx: Some(shutdown_tx),
        server_task: Some(server_task),
    })
}

async fn shutdown(mut runtime: ServerRuntime) {
    runtime.coordinator.tx_queue().close();
    if let Some(tx) = runtime.shutdown_tx.take() {
        let _ = tx.send(());
    }
    if let Some(task) = runtime.server_task.take() {
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("wait for server task")
            .expect("join server task");
    }
}

fn deposit(index: u64) -> L1IncomingMessage {
    let mut request_id = B256::ZERO;
    request_id.0[24..].copy_from_slice(&index.to_be_bytes());
    L1IncomingMessage {
        header: L1IncomingMessageHeader {
            kind: L1MessageKind::EthDeposit,
            sender: Address::repeat_byte(0xaa),
            block_number: 1,
            timestamp: 1_700_000_000 + index,
            request_id: Some(request_id),
            base_fee_l1: U256::ZERO,
        },
        l2_msg: None,
        batch_gas_cost: None,
    }
}

async fn rpc(addr: std::net::SocketAddr, method: &str, params: Value) -> (u16, Value) {
    rpc_with_timeout(addr, method, params, Duration::from_secs(2)).await
}

async fn rpc_with_timeout(
    addr: std::net::SocketAddr,
    method: &str,
    params: Value,
    read_timeout: Duration,
) -> (u16, Value) {
    let request = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let (status, body) =
        post_json_with_timeout(addr, "/", request.to_string(), read_timeout).await;
    let body = serde_json::from_str(&body).unwrap_or_else(|err| panic!("rpc body {body}: {err}"));
    (status, body)
}

async fn post_json(addr: std::net::SocketAddr, path: &str, body: String) -> (u16, String) {
    post_json_with_timeout(addr, path, body, Duration::from_secs(2)).await
}

async fn post_json_with_timeout(
    addr: std::net::SocketAddr,
    path: &str,
    body: String,
    read_timeout: Duration,
) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect http socket");
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write http request");
    stream.flush().await.expect("flush http request");

    let mut response = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read_result = tokio::time::timeout(read_timeout, stream.read(&mut chunk))
            .await
            .expect("timed out while reading http response")
            .expect("read http response");
        if read_result == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read_result]);

        if let Some((header_end, content_length)) = response_content_len(response.as_slice())
            && response.len() >= header_end.saturating_add(content_length)
        {
            break;
        }
    }
    parse_http_response(response.as_slice())
}

fn parse_http_response(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8(raw.to_vec()).expect("http response utf8");
    let mut sections = text.splitn(2, "\r\n\r\n");
    let headers = sections.next().unwrap_or_default();
    let body = sections.next().unwrap_or_default().to_string();

    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .expect("status code")
        .parse::<u16>()
        .expect("parse status code");
    (status, body)
}

fn response_content_len(raw: &[u8]) -> Option<(usize, usize)> {
    let header_end = raw.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
    let headers = std::str::from_utf8(&raw[..header_end]).ok()?;
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.eq_ignore_ascii_case("content-length") {
            return None;
        }
        Some((header_end, value.trim().parse::<usize>().ok()?))
    })
}
