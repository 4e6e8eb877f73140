//! Integration tests for the dispatch engine and its transports
//!
//! Every test binds real sockets on ephemeral loopback ports and observes the
//! engine only through its hooks, the way embedding code does.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lane_server::{
    async_trait, CancellationToken, MessageAttr, MessageErrorAction, MessageType, Network, RpcService, Server,
    ServerBuilder, ServerConfig, ServerError, ServerState, WebsocketMessageType,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Builds a server in `multiple` mode, lets `register` attach hooks, and
/// starts it on an ephemeral loopback port.
async fn start_server(
    network: Network,
    config: ServerConfig,
    register: impl FnOnce(&Server),
) -> Server {
    init_tracing();
    let server = ServerBuilder::new(network)
        .config(config.with_multiple())
        .build()
        .await
        .expect("Failed to build server");
    register(&server);
    server.run("127.0.0.1:0").await.expect("Failed to start server");
    server
}

fn local_addr(server: &Server) -> SocketAddr {
    server.local_addr().expect("server has no local address")
}

async fn eventually(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for hook")
        .expect("hook channel closed")
}

fn cross_attrs(server_id: i64) -> Vec<MessageAttr> {
    vec![MessageAttr::ServerId(server_id), MessageAttr::Bytes(Bytes::new())]
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_end_to_end() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = start_server(
        Network::Tcp4,
        ServerConfig::default().with_core(2).with_message_buffer_size(10),
        move |srv| {
            srv.events().on_connection_receive_packet(move |_, _, packet| {
                tx.send(packet.clone()).unwrap();
            });
        },
    )
    .await;
    assert_eq!(server.shard_count(), 2);
    assert_eq!(server.active_dispatch_loops(), 2);

    let stream = TcpStream::connect(local_addr(&server)).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let payloads: Vec<Bytes> = (0..5u8)
        .map(|n| Bytes::from(vec![n; (n as usize + 1) * 3]))
        .collect();
    for payload in &payloads {
        framed.send(payload.clone()).await.unwrap();
    }

    for expected in &payloads {
        assert_eq!(&recv(&mut rx).await, expected);
    }
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "a payload was delivered twice");

    let started = Instant::now();
    server.shutdown(None, None).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(eventually(Duration::from_secs(3), || server.active_dispatch_loops() == 0).await);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_write_and_close_hooks() {
    let opened = Arc::new(AtomicUsize::new(0));
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let opened_count = opened.clone();
    let server = start_server(Network::Tcp, ServerConfig::default(), move |srv| {
        srv.events().on_connection_opened(move |_, _| {
            opened_count.fetch_add(1, Ordering::SeqCst);
        });
        srv.events().on_connection_closed(move |_, conn, _| {
            closed_tx.send(conn.id().to_string()).unwrap();
        });
        srv.events().on_connection_receive_packet(|_, conn, packet| {
            conn.write(packet).unwrap();
        });
    })
    .await;

    let stream = TcpStream::connect(local_addr(&server)).await.unwrap();
    let client_addr = stream.local_addr().unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::from_static(b"echo me")).await.unwrap();
    let echoed = timeout(Duration::from_secs(3), framed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&echoed[..], b"echo me");
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    drop(framed);
    assert_eq!(recv(&mut closed_rx).await, client_addr.to_string());
    sleep(Duration::from_millis(50)).await;
    assert!(closed_rx.try_recv().is_err(), "closed hook fired twice");

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_packets_stay_on_one_shard() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp4, ServerConfig::default().with_core(4), move |srv| {
        srv.events().on_connection_receive_packet(move |_, _, packet| {
            let thread = std::thread::current().name().map(str::to_string);
            tx.send((packet[0], thread)).unwrap();
        });
    })
    .await;

    let stream = TcpStream::connect(local_addr(&server)).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    for n in 0..50u8 {
        framed.send(Bytes::from(vec![n])).await.unwrap();
    }

    let mut threads = std::collections::HashSet::new();
    for expected in 0..50u8 {
        let (n, thread) = recv(&mut rx).await;
        assert_eq!(n, expected);
        threads.insert(thread);
    }
    assert_eq!(threads.len(), 1);
    let thread = threads.into_iter().next().unwrap().unwrap();
    assert!(thread.starts_with("lane-shard-"));

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_on_one_shard_keep_push_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp, ServerConfig::default().with_core(4), move |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
        srv.events().on_receive_cross_packet(move |_, server_id, _| {
            tx.send(server_id).unwrap();
        });
    })
    .await;

    for id in 0..500 {
        server.push_message(MessageType::Cross, cross_attrs(id)).await.unwrap();
    }
    for id in 500..1000 {
        server
            .push_message_to("room-1", MessageType::Cross, cross_attrs(id))
            .await
            .unwrap();
    }

    let mut received = Vec::with_capacity(1000);
    for _ in 0..1000 {
        received.push(recv(&mut rx).await);
    }
    // The two batches may land on different shards and interleave.
    let unkeyed: Vec<i64> = received.iter().copied().filter(|id| *id < 500).collect();
    let keyed: Vec<i64> = received.iter().copied().filter(|id| *id >= 500).collect();
    assert_eq!(unkeyed, (0..500).collect::<Vec<_>>());
    assert_eq!(keyed, (500..1000).collect::<Vec<_>>());

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_fault_does_not_stop_shard() {
    let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp, ServerConfig::default(), move |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
        srv.events().on_receive_cross_packet(move |_, server_id, _| match server_id {
            2 => std::panic::panic_any(ServerError::Internal("bad packet".into())),
            4 => panic!("plain panic"),
            _ => processed_tx.send(server_id).unwrap(),
        });
        srv.events().on_message_error(move |_, msg, err| {
            error_tx.send((msg.kind(), err.to_string())).unwrap();
        });
    })
    .await;

    for id in 1..=5 {
        server.push_message(MessageType::Cross, cross_attrs(id)).await.unwrap();
    }

    assert_eq!(recv(&mut processed_rx).await, 1);
    assert_eq!(recv(&mut processed_rx).await, 3);
    assert_eq!(recv(&mut processed_rx).await, 5);
    assert_eq!(
        recv(&mut error_rx).await,
        (MessageType::Cross, "internal error: bad packet".to_string())
    );
    sleep(Duration::from_millis(50)).await;
    assert!(error_rx.try_recv().is_err(), "non-error panic reached the error hook");
    assert_eq!(server.active_dispatch_loops(), 1);

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_message_reaches_error_hook() {
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp, ServerConfig::default(), move |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
        srv.events().on_message_error(move |_, _, err| {
            error_tx.send(err.clone()).unwrap();
        });
    })
    .await;

    server
        .push_message(MessageType::Cross, vec![MessageAttr::Bytes(Bytes::new())])
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut error_rx).await,
        ServerError::MessageDecode { kind: MessageType::Cross, .. }
    ));

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_low_latency_threshold() {
    let (processed_tx, mut processed_rx) = mpsc::unbounded_channel();
    let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp, ServerConfig::default(), move |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
        srv.events().on_receive_cross_packet(move |_, server_id, _| {
            let pause = if server_id == 1 { 150 } else { 10 };
            std::thread::sleep(Duration::from_millis(pause));
            processed_tx.send(server_id).unwrap();
        });
        srv.events().on_message_low_latency(move |_, msg, cost| {
            let (server_id, _) = msg.deconstruct_cross().unwrap();
            slow_tx.send((server_id, cost)).unwrap();
        });
    })
    .await;

    server.push_message(MessageType::Cross, cross_attrs(1)).await.unwrap();
    server.push_message(MessageType::Cross, cross_attrs(2)).await.unwrap();
    assert_eq!(recv(&mut processed_rx).await, 1);
    assert_eq!(recv(&mut processed_rx).await, 2);

    let (server_id, cost) = recv(&mut slow_rx).await;
    assert_eq!(server_id, 1);
    assert!(cost >= Duration::from_millis(150));
    sleep(Duration::from_millis(100)).await;
    assert!(slow_rx.try_recv().is_err(), "fast handler was reported as slow");

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_shutdown_runs_once() {
    let stops = Arc::new(AtomicUsize::new(0));
    let stop_count = stops.clone();
    let server = start_server(Network::Tcp, ServerConfig::default().with_core(2), move |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
        srv.events().on_stop(move |_| {
            stop_count.fetch_add(1, Ordering::SeqCst);
        });
    })
    .await;

    let first = server.clone();
    let second = server.clone();
    let joined = timeout(Duration::from_secs(5), async move {
        tokio::join!(first.shutdown(None, None), second.shutdown(None, None))
    })
    .await;
    assert!(joined.is_ok());
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    server.shutdown(None, None).await;
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(matches!(
        server.push_message(MessageType::Cross, cross_attrs(1)).await,
        Err(ServerError::PipelineClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_blocks_until_shutdown() {
    init_tracing();
    let server = ServerBuilder::new(Network::Tcp4).build().await.unwrap();
    server.events().on_connection_receive_packet(|_, _, _| {});

    let runner = server.clone();
    let running = tokio::spawn(async move { runner.run("127.0.0.1:0").await });
    assert!(eventually(Duration::from_secs(3), || server.local_addr().is_some()).await);
    assert!(!running.is_finished());
    assert!(matches!(
        server.run("127.0.0.1:0").await,
        Err(ServerError::NotRunnable("running"))
    ));

    server.shutdown(None, None).await;
    let result = timeout(Duration::from_secs(3), running).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_startup_leaves_nothing_bound() {
    init_tracing();
    for round in 0..20u64 {
        let server = ServerBuilder::new(Network::Tcp4).build().await.unwrap();
        server.events().on_connection_receive_packet(|_, _, _| {});

        let runner = server.clone();
        let running = tokio::spawn(async move { runner.run("127.0.0.1:0").await });
        // Sweep the shutdown across the startup window.
        sleep(Duration::from_micros(round * 50)).await;
        server.shutdown(None, None).await;

        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(
            matches!(result, Ok(()) | Err(ServerError::NotRunnable(_))),
            "round {round}: unexpected run result {result:?}"
        );
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(eventually(Duration::from_secs(3), || server.active_dispatch_loops() == 0).await);
        if let Some(addr) = server.local_addr() {
            assert!(
                TcpStream::connect(addr).await.is_err(),
                "round {round}: listener on {addr} survived shutdown"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_message_with_shutdown_action_stops_run() {
    init_tracing();
    let server = ServerBuilder::new(Network::Tcp4).build().await.unwrap();
    server.events().on_connection_receive_packet(|_, _, _| {});

    let runner = server.clone();
    let running = tokio::spawn(async move { runner.run("127.0.0.1:0").await });
    assert!(eventually(Duration::from_secs(3), || server.local_addr().is_some()).await);

    server
        .push_message(
            MessageType::Error,
            vec![
                MessageAttr::Error(ServerError::Internal("fatal".into())),
                MessageAttr::Action(MessageErrorAction::Shutdown),
            ],
        )
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Internal(message)) if message == "fatal"));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_is_returned_from_run() {
    init_tracing();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let server = ServerBuilder::new(Network::Tcp4)
        .config(ServerConfig::default().with_multiple())
        .build()
        .await
        .unwrap();
    server.events().on_connection_receive_packet(|_, _, _| {});

    assert!(matches!(server.run(&addr).await, Err(ServerError::Network(_))));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(eventually(Duration::from_secs(3), || server.active_dispatch_loops() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_websocket_type_enforcement() {
    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let config = ServerConfig::default()
        .with_websocket_message_types(&[WebsocketMessageType::Binary, WebsocketMessageType::Ping]);

    init_tracing();
    let server = ServerBuilder::new(Network::Websocket)
        .config(config.with_multiple())
        .build()
        .await
        .unwrap();
    server.events().on_connection_opened(move |_, conn| {
        let tags = conn.get_data_as::<Vec<String>>("tag").map(|tags| (*tags).clone());
        opened_tx.send((conn.id().to_string(), tags)).unwrap();
    });
    server
        .events()
        .on_connection_receive_websocket_packet(move |_, conn, packet, kind| {
            packet_tx.send((packet.clone(), kind)).unwrap();
            conn.write(packet).unwrap();
        });
    server.events().on_connection_closed(move |_, _, err| {
        closed_tx.send(err.cloned()).unwrap();
    });
    server.run("127.0.0.1:0/ws").await.unwrap();

    let url = format!("ws://{}/ws?tag=a&tag=b", local_addr(&server));
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("X-Real-IP", "10.1.2.3".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let (id, tags) = recv(&mut opened_rx).await;
    assert_eq!(id, "10.1.2.3");
    assert_eq!(tags, Some(vec!["a".to_string(), "b".to_string()]));

    socket
        .send(WsMessage::Binary(vec![0u8, 1, 2, 255].into()))
        .await
        .unwrap();
    let (packet, kind) = recv(&mut packet_rx).await;
    assert_eq!(&packet[..], &[0u8, 1, 2, 255]);
    assert_eq!(kind, WebsocketMessageType::Binary);
    let echoed = timeout(Duration::from_secs(3), socket.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(echoed, WsMessage::Binary(data) if data[..] == [0u8, 1, 2, 255]));

    socket.send(WsMessage::Text("not allowed".into())).await.unwrap();
    let reason = recv(&mut closed_rx).await;
    assert!(matches!(
        reason,
        Some(ServerError::WebsocketIllegalMessageType(WebsocketMessageType::Text))
    ));
    sleep(Duration::from_millis(100)).await;
    assert!(closed_rx.try_recv().is_err(), "closed hook fired twice");
    assert!(packet_rx.try_recv().is_err(), "illegal frame was forwarded");

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_udp_peer_connection() {
    let opened = Arc::new(AtomicUsize::new(0));
    let opened_count = opened.clone();
    let server = start_server(Network::Udp4, ServerConfig::default(), move |srv| {
        srv.events().on_connection_opened(move |_, _| {
            opened_count.fetch_add(1, Ordering::SeqCst);
        });
        srv.events().on_connection_receive_packet(|_, conn, packet| {
            conn.write(packet).unwrap();
        });
    })
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = local_addr(&server);
    let mut buf = [0u8; 64];
    for payload in [&b"first"[..], &b"second"[..]] {
        client.send_to(payload, target).await.unwrap();
        let (len, from) = timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, target);
        assert_eq!(&buf[..len], payload);
    }
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    server.shutdown(None, None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_udp_peers_are_expired() {
    let opened = Arc::new(AtomicUsize::new(0));
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let opened_count = opened.clone();
    let server = start_server(
        Network::Udp4,
        ServerConfig::default().with_datagram_idle_timeout(Duration::from_millis(200)),
        move |srv| {
            srv.events().on_connection_opened(move |_, _| {
                opened_count.fetch_add(1, Ordering::SeqCst);
            });
            srv.events().on_connection_closed(move |_, conn, err| {
                closed_tx.send((conn.id().to_string(), err.is_some())).unwrap();
            });
            srv.events().on_connection_receive_packet(|_, _, _| {});
        },
    )
    .await;
    let target = local_addr(&server);

    let mut clients = Vec::new();
    for _ in 0..5 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", target).await.unwrap();
        clients.push(client);
    }
    assert!(eventually(Duration::from_secs(3), || opened.load(Ordering::SeqCst) == 5).await);

    let mut expired = Vec::new();
    for _ in 0..5 {
        let (id, with_error) = recv(&mut closed_rx).await;
        assert!(with_error, "idle expiry should report a reason");
        expired.push(id);
    }
    expired.sort();
    let mut expected: Vec<String> = clients.iter().map(|c| c.local_addr().unwrap().to_string()).collect();
    expected.sort();
    assert_eq!(expired, expected);

    // A returning peer gets a fresh connection.
    clients[0].send_to(b"again", target).await.unwrap();
    assert!(eventually(Duration::from_secs(3), || opened.load(Ordering::SeqCst) == 6).await);

    server.shutdown(None, None).await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_unix_socket_echo() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("lane-server-{}.sock", std::process::id()));
    let path = path.to_string_lossy().into_owned();

    let server = ServerBuilder::new(Network::Unix)
        .config(ServerConfig::default().with_multiple())
        .build()
        .await
        .unwrap();
    server.events().on_connection_receive_packet(|_, conn, packet| {
        conn.write(packet).unwrap();
    });
    server.run(&path).await.unwrap();

    let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::from_static(b"over unix")).await.unwrap();
    let echoed = timeout(Duration::from_secs(3), framed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(&echoed[..], b"over unix");

    server.shutdown(None, None).await;
    assert!(!std::path::Path::new(&path).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_routes() {
    init_tracing();
    let server = ServerBuilder::new(Network::Http)
        .config(ServerConfig::default().with_multiple())
        .http_routes(|router| router.route("/ping", lane_server::axum::routing::get(|| async { "pong" })))
        .build()
        .await
        .unwrap();
    server
        .http_routes(|router| router.route("/health", lane_server::axum::routing::get(|| async { "ok" })))
        .unwrap();
    server.run("127.0.0.1:0").await.unwrap();
    assert_eq!(server.active_dispatch_loops(), 0);

    for (path, body) in [("/ping", "pong"), ("/health", "ok")] {
        let mut stream = TcpStream::connect(local_addr(&server)).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(3), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(body));
    }

    server.shutdown(None, None).await;
    assert_eq!(server.state(), ServerState::Stopped);
}

struct Greeter {
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl RpcService for Greeter {
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (mut stream, _) = accepted?;
                    stream.write_all(b"hello").await?;
                }
            }
        }
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_service_lifecycle() {
    init_tracing();
    let stopped = Arc::new(AtomicUsize::new(0));
    let server = ServerBuilder::new(Network::Rpc)
        .config(ServerConfig::default().with_multiple())
        .rpc_service(Greeter {
            stopped: stopped.clone(),
        })
        .build()
        .await
        .unwrap();
    server.run("127.0.0.1:0").await.unwrap();

    let mut stream = TcpStream::connect(local_addr(&server)).await.unwrap();
    let mut greeting = [0u8; 5];
    timeout(Duration::from_secs(3), stream.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"hello");

    server.shutdown(None, None).await;
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_requires_service() {
    init_tracing();
    let server = ServerBuilder::new(Network::Rpc).build().await.unwrap();
    assert!(matches!(server.run("127.0.0.1:0").await, Err(ServerError::Network(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ticker_runs_on_dispatch_loop() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = start_server(Network::Tcp, ServerConfig::default().with_ticker(false), |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
    })
    .await;

    let ticker = server.ticker().unwrap();
    assert!(!ticker.is_autonomous());
    ticker.after("probe", Duration::from_millis(10), move || {
        let thread = std::thread::current().name().map(str::to_string);
        tx.send(thread).unwrap();
    });
    let thread = recv(&mut rx).await.unwrap();
    assert_eq!(thread, "lane-shard-0");

    ticker.repeat("loop", Duration::ZERO, Duration::from_millis(10), None, || {});
    assert_eq!(ticker.timer_count(), 1);
    server.shutdown(None, None).await;
    assert_eq!(ticker.timer_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quic_listener_starts_and_stops() {
    let server = start_server(Network::Quic, ServerConfig::default(), |srv| {
        srv.events().on_connection_receive_packet(|_, _, _| {});
    })
    .await;
    assert!(server.local_addr().is_some());

    let started = Instant::now();
    server.shutdown(None, None).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quic_session_delivers_and_echoes() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let opened_count = opened.clone();
    let closed_count = closed.clone();
    let server = start_server(
        Network::Quic,
        ServerConfig::default().with_tls(&cert_path, &key_path),
        move |srv| {
            srv.events().on_connection_opened(move |_, _| {
                opened_count.fetch_add(1, Ordering::SeqCst);
            });
            srv.events().on_connection_receive_packet(move |_, conn, packet| {
                packet_tx.send(packet.clone()).unwrap();
                conn.write(packet).unwrap();
            });
            srv.events().on_connection_closed(move |_, _, _| {
                closed_count.fetch_add(1, Ordering::SeqCst);
            });
        },
    )
    .await;

    let _ = rustls::crypto::ring::default_provider().install_default();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap();
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    let connection = timeout(
        Duration::from_secs(5),
        endpoint.connect(local_addr(&server), "localhost").unwrap(),
    )
    .await
    .unwrap()
    .unwrap();
    let (send, recv_stream) = connection.open_bi().await.unwrap();
    let mut writer = FramedWrite::new(send, LengthDelimitedCodec::new());
    let mut reader = FramedRead::new(recv_stream, LengthDelimitedCodec::new());

    let payloads = [Bytes::from_static(b"alpha"), Bytes::from_static(b"beta"), Bytes::from(vec![7u8; 2048])];
    for payload in &payloads {
        writer.send(payload.clone()).await.unwrap();
    }
    for expected in &payloads {
        assert_eq!(&recv(&mut packet_rx).await, expected);
    }
    for expected in &payloads {
        let echoed = timeout(Duration::from_secs(3), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&echoed[..], &expected[..]);
    }
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    connection.close(0u32.into(), b"bye");
    assert!(eventually(Duration::from_secs(3), || closed.load(Ordering::SeqCst) == 1).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    server.shutdown(None, None).await;
}
