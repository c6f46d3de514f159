//! End-to-end tests against a scripted peer over an in-memory stream.

use futures::{SinkExt, StreamExt};
use proven_file_rpc::*;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_test::traced_test;

struct Peer {
    frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    sink: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    next_id: u64,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            frames: FramedRead::new(read, FrameCodec::new()),
            sink: FramedWrite::new(write, FrameCodec::new()),
            next_id: 1000,
        }
    }

    async fn next_request(&mut self) -> (u64, Request) {
        let envelope = self.frames.next().await.unwrap().unwrap();
        assert_eq!(envelope.service, "file");
        match envelope.body {
            Body::Request(request) => (envelope.id, request),
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn respond(&mut self, request_id: u64, result: Value) {
        let id = self.id();
        self.sink
            .send(Envelope::response(id, "file", request_id, result))
            .await
            .unwrap();
    }

    async fn fail(&mut self, request_id: u64, code: i32, description: &str) {
        let id = self.id();
        self.sink
            .send(Envelope::error(id, "file", request_id, code, description, None))
            .await
            .unwrap();
    }

    async fn emit(&mut self, name: &str, args: Vec<Value>) {
        let id = self.id();
        self.sink
            .send(Envelope::event(id, "file", name, args))
            .await
            .unwrap();
    }
}

fn setup(builder: ClientBuilder) -> (RpcClient, Peer) {
    let (client_side, peer_side) = tokio::io::duplex(64 * 1024);
    (builder.from_stream(client_side), Peer::new(peer_side))
}

async fn wait_for_state(client: &RpcClient, target: ConnectionState) {
    let mut changes = client.state_changes();
    tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == target))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_read_file_resolves_with_bytes() {
    let (client, mut peer) = setup(RpcClient::builder());

    let server = async {
        let (id, request) = peer.next_request().await;
        assert_eq!(id, 1);
        assert_eq!(request.method, "readFile");
        assert_eq!(request.args, vec![Value::from("/a.txt")]);
        peer.respond(id, Value::from(b"hello world".to_vec())).await;
    };

    let (result, ()) = tokio::join!(
        client.call("file", "readFile", vec![Value::from("/a.txt")]),
        server
    );

    assert_eq!(
        result.unwrap().as_bytes().map(|b| b.to_vec()),
        Some(b"hello world".to_vec())
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_remote_error_reaches_caller() {
    let (client, mut peer) = setup(RpcClient::builder());

    let server = async {
        let (id, _) = peer.next_request().await;
        peer.fail(id, 404, "not found").await;
    };

    let (result, ()) = tokio::join!(
        client.call("file", "readFile", vec![Value::from("/missing")]),
        server
    );

    let err = result.unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.code, 404);
    assert_eq!(remote.description, "not found");
    assert!(!remote.unsolicited);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_file_change_event_reaches_every_subscriber() {
    let (client, mut peer) = setup(RpcClient::builder());
    let mut first = client.subscribe("fileChange");
    let mut second = client.subscribe("fileChange");
    let mut other = client.subscribe("workspaceChange");

    let args = vec![Value::from("/b.txt"), Value::Int(1)];
    peer.emit("fileChange", args.clone()).await;

    assert_eq!(first.recv().await.unwrap().unwrap(), args);
    assert_eq!(second.next().await.unwrap().unwrap(), args);
    assert_eq!(client.pending_count(), 0);

    // The unrelated subscription only sees its own event.
    peer.emit("workspaceChange", vec![]).await;
    assert_eq!(other.recv().await.unwrap().unwrap(), Vec::<Value>::new());
}

#[tokio::test]
async fn test_concurrent_calls_answered_out_of_order() {
    let (client, mut peer) = setup(RpcClient::builder());

    let server = async {
        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(peer.next_request().await);
        }
        for (id, request) in requests.into_iter().rev() {
            peer.respond(id, Value::from(request.method)).await;
        }
    };

    let (a, b, c, ()) = tokio::join!(
        client.call("file", "stat", vec![]),
        client.call("file", "readdir", vec![]),
        client.call("file", "realpath", vec![]),
        server
    );

    assert_eq!(a.unwrap(), Value::from("stat"));
    assert_eq!(b.unwrap(), Value::from("readdir"));
    assert_eq!(c.unwrap(), Value::from("realpath"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_timeout_evicts_call_and_late_answer_is_ignored() {
    let (client, mut peer) = setup(RpcClient::builder());

    let server = async { peer.next_request().await.0 };
    let (result, id) = tokio::join!(
        client.call_with_timeout("file", "stat", vec![], Some(Duration::from_millis(50))),
        server
    );

    assert!(result.unwrap_err().is_timeout());
    assert_eq!(client.pending_count(), 0);

    // The late answer is dropped and the connection keeps working.
    peer.respond(id, Value::Bool(true)).await;
    let server = async {
        let (id, _) = peer.next_request().await;
        peer.respond(id, Value::Int(7)).await;
    };
    let (result, ()) = tokio::join!(client.call("file", "stat", vec![]), server);
    assert_eq!(result.unwrap(), Value::Int(7));
}

#[tokio::test]
async fn test_too_deep_argument_fails_only_its_call() {
    let (client, mut peer) = setup(RpcClient::builder());

    let deep = (0..MAX_VALUE_DEPTH).fold(Value::from("/a"), |inner, _| Value::Array(vec![inner]));
    let err = client
        .call("file", "writeFile", vec![deep])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Codec(CodecError::SerializationFailed(_))
    ));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.pending_count(), 0);

    let server = async {
        let (id, request) = peer.next_request().await;
        assert_eq!(request.method, "stat");
        peer.respond(id, Value::Bool(true)).await;
    };
    let (result, ()) = tokio::join!(client.call("file", "stat", vec![]), server);
    assert_eq!(result.unwrap(), Value::Bool(true));
}

#[tokio::test]
async fn test_pending_ttl_expires_unbounded_call() {
    let (client, mut peer) = setup(RpcClient::builder().pending_ttl(Duration::from_millis(50)));

    let server = async { peer.next_request().await };
    let (result, _) = tokio::join!(
        client.call_with_timeout("file", "watch", vec![], None),
        server
    );

    assert!(result.unwrap_err().is_timeout());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_deadline_covers_blocked_write() {
    // The peer never reads, so a large request stalls mid-frame.
    let (client_side, _peer_side) = tokio::io::duplex(64);
    let client = RpcClient::builder().from_stream(client_side);

    let deadline = Duration::from_millis(100);
    let stalled = client.call_with_timeout(
        "file",
        "writeFile",
        vec![Value::from(vec![0u8; 4096])],
        Some(deadline),
    );
    let waiting = client.call_with_timeout("file", "stat", vec![], Some(deadline));

    let (stalled, waiting) = tokio::time::timeout(
        Duration::from_secs(2),
        async { tokio::join!(stalled, waiting) },
    )
    .await
    .expect("deadline not applied to the write");

    assert!(stalled.unwrap_err().is_timeout());
    let err = waiting.unwrap_err();
    assert!(err.is_timeout() || err.is_connection_lost());

    wait_for_state(&client, ConnectionState::Faulted).await;
    assert_eq!(client.pending_count(), 0);

    let err = client.call("file", "stat", vec![]).await.unwrap_err();
    assert!(err.is_connection_lost());
}

#[tokio::test]
#[traced_test]
async fn test_socket_close_fails_outstanding_call() {
    let (client, mut peer) = setup(RpcClient::builder());
    let mut changes = client.subscribe("fileChange");

    let server = async {
        peer.next_request().await;
        drop(peer);
    };
    let (result, ()) = tokio::join!(client.call("file", "readFile", vec![]), server);

    let err = result.unwrap_err();
    assert!(err.is_connection_lost());
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::Lost(LossReason::Closed))
    ));

    wait_for_state(&client, ConnectionState::Closed).await;
    assert_eq!(client.pending_count(), 0);

    assert!(changes.recv().await.unwrap().unwrap_err().is_connection_lost());
    assert!(changes.recv().await.is_none());
}

#[tokio::test]
async fn test_late_frame_after_close_is_ignored() {
    let (client_side, peer_side) = tokio::io::duplex(1024);
    let connection = Connection::from_stream(
        client_side,
        &ConnectionConfig::default(),
        Dispatcher::default(),
    );
    let call = connection.dispatcher().register_pending(7).unwrap();

    drop(peer_side);
    assert!(call.await.unwrap_err().is_connection_lost());
    assert_eq!(connection.state(), ConnectionState::Closed);

    let late = Envelope::response(8, "file", 7, Value::from("late"));
    assert_eq!(connection.dispatcher().on_envelope(late), Dispatched::Ignored);
    assert_eq!(connection.dispatcher().pending_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_malformed_frame_faults_connection() {
    let (client_side, mut peer_side) = tokio::io::duplex(1024);
    let client = RpcClient::builder().from_stream(client_side);
    let mut changes = client.subscribe("fileChange");

    // Length 3, then bytes that are not a valid envelope.
    peer_side
        .write_all(&[0, 0, 0, 3, 0xFF, 0xFF, 0xFF])
        .await
        .unwrap();

    wait_for_state(&client, ConnectionState::Faulted).await;

    let err = changes.recv().await.unwrap().unwrap_err();
    assert!(err.is_connection_lost());
    assert!(err.to_string().contains("faulted"));
    assert!(changes.recv().await.is_none());

    let err = client.call("file", "stat", vec![]).await.unwrap_err();
    assert!(err.is_connection_lost());
}

#[tokio::test]
async fn test_oversized_frame_faults_connection() {
    let (client_side, mut peer_side) = tokio::io::duplex(1024);
    let client = RpcClient::builder()
        .max_frame_size(16)
        .from_stream(client_side);

    peer_side.write_all(&1024u32.to_be_bytes()).await.unwrap();
    wait_for_state(&client, ConnectionState::Faulted).await;
}

#[tokio::test]
async fn test_unsolicited_error_fails_pending_but_keeps_connection() {
    let (client, mut peer) = setup(RpcClient::builder());

    let server = async {
        peer.next_request().await;
        peer.fail(0, 503, "service restarting").await;
    };
    let (result, ()) = tokio::join!(client.call("file", "stat", vec![]), server);

    let err = result.unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.code, 503);
    assert!(remote.unsolicited);
    assert_eq!(client.state(), ConnectionState::Connected);

    let server = async {
        let (id, _) = peer.next_request().await;
        peer.respond(id, Value::Bool(true)).await;
    };
    let (result, ()) = tokio::join!(client.call("file", "stat", vec![]), server);
    assert_eq!(result.unwrap(), Value::Bool(true));
}

#[tokio::test]
async fn test_close_fails_outstanding_calls() {
    let (client, mut peer) = setup(RpcClient::builder());

    let closer = async {
        peer.next_request().await;
        client.close().await.unwrap();
    };
    let (result, ()) = tokio::join!(client.call("file", "stat", vec![]), closer);

    assert!(matches!(
        result.unwrap_err(),
        Error::Connection(ConnectionError::Lost(LossReason::ClosedByClient))
    ));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, write) = socket.into_split();
        let mut frames = FramedRead::new(read, FrameCodec::new());
        let mut sink = FramedWrite::new(write, FrameCodec::new());

        let envelope = frames.next().await.unwrap().unwrap();
        let Body::Request(request) = envelope.body else {
            panic!("expected request");
        };
        sink.send(Envelope::response(1, "file", envelope.id, Value::from(request.method)))
            .await
            .unwrap();
    });

    let client = RpcClient::builder()
        .tcp("127.0.0.1", port)
        .connect()
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let result = client.call("file", "exists", vec![Value::from("/")]).await.unwrap();
    assert_eq!(result, Value::from("exists"));

    server.await.unwrap();
    client.close().await.unwrap();
}
