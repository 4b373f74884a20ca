//! Graceful shutdown and ordering guarantees observed from a raw TCP peer.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use rivet::{
    codec::{Coder, LengthValue},
    error::CodecError,
    Callbacks, Connection, ConnectionState, Engine, EngineConfig, Server,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Encodes `u64`s as eight big-endian bytes and records the order they were encoded in.
#[derive(Clone, Default)]
struct RecordingCoder {
    encoded: Arc<Mutex<Vec<u64>>>,
}

impl Coder<u64> for RecordingCoder {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn encode(&self, msg: &u64) -> Result<Bytes, CodecError> {
        self.encoded.lock().push(*msg);
        Ok(Bytes::copy_from_slice(&msg.to_be_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<u64, CodecError> {
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CodecError::Malformed("expected eight bytes".into()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

fn engine(
    handler: Callbacks<u64>,
    coder: RecordingCoder,
    linger: Duration,
) -> Result<Engine<u64>, Box<dyn std::error::Error>> {
    let config = EngineConfig {
        linger_ms: linger.as_millis() as u64,
        ..EngineConfig::default()
    };
    let engine = Engine::builder(config)
        .handler(handler)
        .framer(LengthValue::default())
        .coder(coder)
        .build_with_builtins()?;
    Ok(engine)
}

fn parse_frames(mut buf: &[u8]) -> Vec<u64> {
    let mut values = Vec::new();
    while buf.len() >= 12 {
        assert_eq!(&buf[..4], &8u32.to_be_bytes());
        values.push(u64::from_be_bytes(buf[4..12].try_into().unwrap()));
        buf = &buf[12..];
    }
    assert!(buf.is_empty(), "trailing partial frame");
    values
}

/// Accepts one TCP connection and wraps it in a started rivet connection.
async fn accept_one(
    engine: &Engine<u64>,
) -> Result<(Connection<u64>, TcpStream), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer = TcpStream::connect(listener.local_addr()?).await?;
    let (stream, addr) = listener.accept().await?;
    let conn = Connection::with_addrs(engine, stream, Some(addr), None);
    assert!(conn.start().await);
    Ok((conn, peer))
}

#[tokio::test]
async fn peer_receives_everything_sent_before_stop() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let engine = engine(Callbacks::new(), RecordingCoder::default(), Duration::from_secs(5))?;
    let (conn, mut peer) = accept_one(&engine).await?;

    for value in [1, 2, 3] {
        conn.send(value)?;
    }
    assert!(conn.stop());

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut buf)).await??;
    assert_eq!(parse_frames(&buf), [1, 2, 3]);

    // Completing the peer's half of the shutdown ends the connection well before the linger
    let started = Instant::now();
    peer.shutdown().await?;
    tokio::time::timeout(Duration::from_secs(2), conn.wait_for_stop()).await?;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.state(), ConnectionState::Stopped);
    engine.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn silent_peer_is_cut_off_after_linger() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let linger = Duration::from_millis(300);
    let engine = engine(Callbacks::new(), RecordingCoder::default(), linger)?;
    let (conn, mut peer) = accept_one(&engine).await?;

    let started = Instant::now();
    conn.send(7)?;
    conn.stop();

    // The peer reads to EOF but never closes its own side
    let mut buf = Vec::new();
    peer.read_to_end(&mut buf).await?;
    assert_eq!(parse_frames(&buf), [7]);

    tokio::time::timeout(Duration::from_secs(3), conn.wait_for_stop()).await?;
    let elapsed = started.elapsed();
    assert!(elapsed >= linger, "stopped after {elapsed:?}");
    engine.shutdown().await;
    drop(peer);

    Ok(())
}

#[tokio::test]
async fn data_arriving_during_linger_is_still_handled() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let record = handled.clone();
    let engine = engine(
        Callbacks::new().on_message(move |event: rivet::Event<u64>| {
            let record = record.clone();
            async move { record.lock().push(event.msg) }
        }),
        RecordingCoder::default(),
        Duration::from_secs(5),
    )?;
    let (conn, mut peer) = accept_one(&engine).await?;

    conn.stop();
    let mut buf = Vec::new();
    peer.read_to_end(&mut buf).await?;
    assert!(buf.is_empty());

    // Our write side is closed, but the peer may still finish what it was sending
    let mut frame = 8u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&42u64.to_be_bytes());
    peer.write_all(&frame).await?;
    peer.shutdown().await?;

    tokio::time::timeout(Duration::from_secs(2), conn.wait_for_stop()).await?;
    engine.shutdown().await;
    assert_eq!(*handled.lock(), [42]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_are_encoded_in_fifo_order() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 1_000;

    let coder = RecordingCoder::default();
    let engine = engine(Callbacks::new(), coder.clone(), Duration::from_secs(5))?;
    let (conn, mut peer) = accept_one(&engine).await?;

    let reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>((buf, peer))
    });

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let conn = conn.clone();
            tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    conn.send(producer << 32 | seq).map_err(|_| "closed")?;
                    if seq % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok::<_, &'static str>(())
            })
        })
        .collect();
    for producer in producers {
        producer.await??;
    }
    conn.stop();

    let (buf, mut peer) = tokio::time::timeout(Duration::from_secs(5), reader).await???;
    peer.shutdown().await?;
    conn.wait_for_stop().await;
    engine.shutdown().await;

    let encoded = coder.encoded.lock().clone();
    assert_eq!(encoded.len() as u64, PRODUCERS * PER_PRODUCER);
    assert_eq!(parse_frames(&buf), encoded);
    for producer in 0..PRODUCERS {
        let seqs: Vec<_> = encoded
            .iter()
            .filter(|value| *value >> 32 == producer)
            .map(|value| value & 0xffff_ffff)
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
    }

    Ok(())
}

#[tokio::test]
async fn concurrent_stops_close_once() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    let engine = engine(
        Callbacks::new().on_close(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }),
        RecordingCoder::default(),
        Duration::from_millis(100),
    )?;
    let (conn, peer) = accept_one(&engine).await?;

    let barrier = Arc::new(tokio::sync::Barrier::new(32));
    let stops: Vec<_> = (0..32)
        .map(|_| {
            let conn = conn.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                conn.stop()
            })
        })
        .collect();
    let mut initiated = 0;
    for stop in stops {
        initiated += stop.await? as usize;
    }
    assert_eq!(initiated, 1);

    drop(peer);
    conn.wait_for_stop().await;
    engine.shutdown().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn server_stop_drains_connected_peers() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let (greeted_tx, greeted_rx) = oneshot::channel();
    let greeted_tx = Arc::new(Mutex::new(Some(greeted_tx)));
    let engine = engine(
        Callbacks::new().on_connected(move |conn: Connection<u64>| {
            let greeted_tx = greeted_tx.clone();
            async move {
                let _ = conn.send(99);
                if let Some(tx) = greeted_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        }),
        RecordingCoder::default(),
        Duration::from_secs(5),
    )?;
    let server = Server::bind(engine, "127.0.0.1:0").await?;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let mut peer = TcpStream::connect(server.local_addr()).await?;
    greeted_rx.await?;
    let stopping = tokio::spawn({
        let server = server.clone();
        async move { server.stop().await }
    });

    let mut buf = Vec::new();
    peer.read_to_end(&mut buf).await?;
    assert_eq!(parse_frames(&buf), [99]);
    peer.shutdown().await?;

    tokio::time::timeout(Duration::from_secs(2), stopping).await??;
    serving.await??;
    assert_eq!(server.sessions(), 0);

    Ok(())
}
