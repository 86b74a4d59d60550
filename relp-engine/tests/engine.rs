use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relp_core::frame::DEFAULT_MAX_DATA_LEN;
use relp_core::{
    decode_frame, encode_frame, CommandHandler, Dispatcher, Frame, FrameDecodeError,
    MessageConsumer, ProtocolError, Response, RspCode, Session, SessionConfig, SessionId,
    SessionState,
};
use relp_engine::{Engine, EngineError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

type Received = Arc<Mutex<Vec<Vec<u8>>>>;

fn collecting_engine(config: SessionConfig) -> (Arc<Engine>, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let consumer = move |_id: SessionId, msg: &[u8]| -> Result<(), String> {
        sink.lock().unwrap().push(msg.to_vec());
        Ok(())
    };
    let engine = Engine::new(config, Arc::new(consumer)).unwrap();
    (Arc::new(engine), received)
}

async fn start_server(engine: &Arc<Engine>) -> (SocketAddr, JoinHandle<Result<(), EngineError>>) {
    engine
        .add_listener_on(Some("127.0.0.1"), Some("0"))
        .await
        .unwrap();
    let addr = engine.local_addrs()[0];
    let runner = engine.clone();
    (addr, tokio::spawn(async move { runner.run().await }))
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Hand-driven client speaking raw frames.
struct RawPeer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, txnr: u32, command: &str, data: &[u8]) {
        let bytes = encode_frame(txnr, command, data).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next frame from the server, or `None` once it closed the connection.
    async fn frame(&mut self) -> Option<Frame> {
        timeout(WAIT, async {
            loop {
                match decode_frame(&self.buf, DEFAULT_MAX_DATA_LEN) {
                    Ok((frame, used)) => {
                        self.buf.drain(..used);
                        return Some(frame);
                    }
                    Err(FrameDecodeError::NeedMore) => {}
                    Err(e) => panic!("server sent a bad frame: {e}"),
                }
                let mut chunk = [0u8; 4096];
                match self.stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                }
            }
        })
        .await
        .expect("no frame in time")
    }

    async fn expect_rsp(&mut self, txnr: u32) -> Response {
        let frame = self.frame().await.expect("connection closed");
        assert_eq!(frame.command(), "rsp");
        assert_eq!(frame.txnr(), txnr);
        Response::parse(frame.data()).unwrap()
    }

    async fn negotiate(&mut self) {
        self.send(1, "init", b"relp_version=1\ncommands=syslog\n").await;
        let offers = self.expect_rsp(1).await;
        assert_eq!(offers.code, RspCode::OK);
        assert_eq!(offers.data, b"relp_version=1\n");
        self.send(2, "go", b"relp_version=1\n").await;
        assert!(self.expect_rsp(2).await.is_success());
    }
}

#[tokio::test]
async fn serves_a_full_session() {
    let (engine, received) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    eventually(|| engine.session_count() == 1).await;

    peer.send(3, "msg", b"<13>hello").await;
    peer.send(4, "msg", b"<13>world").await;
    assert!(peer.expect_rsp(3).await.is_success());
    assert!(peer.expect_rsp(4).await.is_success());
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"<13>hello".to_vec(), b"<13>world".to_vec()]
    );

    peer.send(5, "close", b"").await;
    assert!(peer.expect_rsp(5).await.is_success());
    assert!(peer.frame().await.is_none());
    eventually(|| engine.session_count() == 0).await;
}

#[tokio::test]
async fn bad_session_does_not_disturb_others() {
    let (engine, received) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut good = RawPeer::connect(addr).await;
    good.negotiate().await;
    eventually(|| engine.session_count() == 1).await;
    let good_id = engine.session_ids()[0];
    let mut bad = RawPeer::connect(addr).await;
    eventually(|| engine.session_count() == 2).await;

    bad.stream.write_all(b"not a frame\n").await.unwrap();
    assert!(bad.frame().await.is_none());
    eventually(|| engine.session_count() == 1).await;
    assert_eq!(engine.session_ids(), vec![good_id]);
    assert_eq!(engine.session_state(good_id), Some(SessionState::Ready));

    good.send(3, "msg", b"still here").await;
    assert!(good.expect_rsp(3).await.is_success());
    assert_eq!(*received.lock().unwrap(), vec![b"still here".to_vec()]);
}

#[tokio::test]
async fn unknown_command_tears_down_session() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    peer.send(3, "foobar", b"").await;
    assert!(peer.frame().await.is_none());
    eventually(|| engine.session_count() == 0).await;
}

#[tokio::test]
async fn go_before_init_tears_down_session() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    eventually(|| engine.session_count() == 1).await;
    peer.send(1, "go", b"relp_version=1\n").await;
    assert!(peer.frame().await.is_none());
    eventually(|| engine.session_count() == 0).await;
}

#[tokio::test]
async fn out_of_order_txnr_tears_down_session() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    peer.send(7, "msg", b"skipped ahead").await;
    assert!(peer.frame().await.is_none());
    eventually(|| engine.session_count() == 0).await;
}

#[tokio::test]
async fn version_mismatch_is_refused_then_closed() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.send(1, "init", b"relp_version=9\n").await;
    let refusal = peer.expect_rsp(1).await;
    assert_eq!(refusal.code, RspCode::ERROR);
    assert!(peer.frame().await.is_none());
    eventually(|| engine.session_count() == 0).await;
}

#[tokio::test]
async fn frames_split_across_writes() {
    let (engine, received) = collecting_engine(SessionConfig::default());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    let bytes = encode_frame(3, "msg", b"split message").unwrap();
    for piece in bytes.chunks(4) {
        peer.stream.write_all(piece).await.unwrap();
        peer.stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(peer.expect_rsp(3).await.is_success());
    assert_eq!(*received.lock().unwrap(), vec![b"split message".to_vec()]);
}

#[tokio::test]
async fn engine_to_engine_delivery() {
    let (server, received) = collecting_engine(SessionConfig::default());
    let (addr, _server_run) = start_server(&server).await;

    let (client, _) = collecting_engine(SessionConfig::default());
    let runner = client.clone();
    let _client_run = tokio::spawn(async move { runner.run().await });

    let id = client.connect(addr).await.unwrap();
    let state = timeout(WAIT, client.wait_for_state(id, SessionState::Ready))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SessionState::Ready);
    eventually(|| {
        server
            .session_ids()
            .into_iter()
            .any(|sid| server.session_state(sid) == Some(SessionState::Ready))
    })
    .await;

    // init took 1 and go took 2.
    assert_eq!(client.send_message(id, b"one").unwrap(), 3);
    assert_eq!(client.send_message(id, b"two").unwrap(), 4);
    eventually(|| received.lock().unwrap().len() == 2).await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![b"one".to_vec(), b"two".to_vec()]
    );

    client.close_session(id).unwrap();
    eventually(|| client.session_state(id).is_none()).await;
    eventually(|| server.session_count() == 0).await;
    assert!(matches!(
        client.send_message(id, b"late"),
        Err(EngineError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn stop_returns_from_run() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let (addr, run) = start_server(&engine).await;
    let _peer = RawPeer::connect(addr).await;

    engine.stop();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(engine.is_stopped());
}

#[tokio::test]
async fn debug_sink_sees_engine_activity() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let captured = lines.clone();
    let sink: Arc<dyn relp_engine::DebugSink> =
        Arc::new(move |args: std::fmt::Arguments<'_>| captured.lock().unwrap().push(args.to_string()));
    engine.set_debug_sink(Some(sink));
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    let lines = lines.clone();
    eventually(move || {
        lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.contains("accepted from"))
    })
    .await;
}

#[test]
fn invalid_session_config_is_rejected() {
    let config = SessionConfig {
        window_size: 0,
        ..SessionConfig::default()
    };
    let consumer = |_: SessionId, _: &[u8]| -> Result<(), String> { Ok(()) };
    assert!(matches!(
        Engine::new(config, Arc::new(consumer)),
        Err(EngineError::Protocol(_))
    ));
}

#[tokio::test]
async fn registrations_wake_a_blocked_loop() {
    let (server, received) = collecting_engine(SessionConfig::default());
    let runner = server.clone();
    let _server_run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    server
        .add_listener_on(Some("127.0.0.1"), Some("0"))
        .await
        .unwrap();
    let addr = server.local_addrs()[0];

    let (client, _) = collecting_engine(SessionConfig::default());
    let runner = client.clone();
    let _client_run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = client.connect(addr).await.unwrap();
    let state = timeout(WAIT, client.wait_for_state(id, SessionState::Ready))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SessionState::Ready);
    client.send_message(id, b"registered late").unwrap();
    eventually(|| received.lock().unwrap().len() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_that_never_reads_does_not_stall_others() {
    let consumer = |_: SessionId, _: &[u8]| -> Result<(), String> { Ok(()) };
    let engine = Arc::new(Engine::new(SessionConfig::default(), Arc::new(consumer)).unwrap());
    let (addr, _run) = start_server(&engine).await;

    // Pipelines messages forever and never reads a single response.
    let mut flooder = RawPeer::connect(addr).await;
    flooder.negotiate().await;
    let flood = tokio::spawn(async move {
        let payload = vec![b'x'; 64];
        let mut txnr = 3;
        loop {
            let bytes = encode_frame(txnr, "msg", &payload).unwrap();
            if flooder.stream.write_all(&bytes).await.is_err() {
                break;
            }
            txnr = if txnr == 999 { 1 } else { txnr + 1 };
        }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut other = RawPeer::connect(addr).await;
    other.negotiate().await;
    other.send(3, "msg", b"served").await;
    assert!(other.expect_rsp(3).await.is_success());
    flood.abort();
}

#[test]
fn dispatch_frame_rejects_go_before_init_and_unknown_commands() {
    let (engine, _) = collecting_engine(SessionConfig::default());
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let captured = lines.clone();
    let sink: Arc<dyn relp_engine::DebugSink> =
        Arc::new(move |args: std::fmt::Arguments<'_>| captured.lock().unwrap().push(args.to_string()));
    engine.set_debug_sink(Some(sink));

    let mut session = Session::server(engine.config()).unwrap();
    let go = Frame::new(1, "go", b"relp_version=1\n".to_vec()).unwrap();
    assert!(matches!(
        engine.dispatch_frame(&mut session, &go),
        Err(ProtocolError::ProtocolViolation { .. })
    ));
    assert_ne!(session.state(), SessionState::Ready);

    let mut session = Session::server(engine.config()).unwrap();
    let unknown = Frame::new(1, "foobar", b"whatever".to_vec()).unwrap();
    assert!(matches!(
        engine.dispatch_frame(&mut session, &unknown),
        Err(ProtocolError::InvalidCommand(c)) if c == "foobar"
    ));
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.contains("dispatching foobar txnr 1")));
}

struct Ping;

impl CommandHandler for Ping {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        if session.state() != SessionState::Ready {
            return Err(ProtocolError::ProtocolViolation {
                command: frame.command().to_string(),
                state: session.state(),
            });
        }
        session.respond(frame.txnr(), &Response::ok_with_data(b"pong".to_vec()))
    }
}

#[tokio::test]
async fn registered_command_answers_over_the_wire() {
    let consumer: Arc<dyn MessageConsumer> =
        Arc::new(|_: SessionId, _: &[u8]| -> Result<(), String> { Ok(()) });
    let mut dispatcher = Dispatcher::new(consumer);
    dispatcher.register("ping", Ping);
    let engine =
        Arc::new(Engine::with_dispatcher(SessionConfig::default(), dispatcher).unwrap());
    let (addr, _run) = start_server(&engine).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.negotiate().await;
    peer.send(3, "ping", b"").await;
    let pong = peer.expect_rsp(3).await;
    assert!(pong.is_success());
    assert_eq!(pong.data, b"pong");
}
