use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use mixctl::{ForwardOptions, Rule, RuleForwarder};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// An echo upstream that counts the connections it accepts.
struct EchoUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl EchoUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        Self { addr, hits }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// A listener whose accept backlog is full, so new dials hang in the handshake.
struct StalledUpstream {
    addr: SocketAddr,
    _listener: TcpListener,
    _held: Vec<TcpStream>,
}

impl StalledUpstream {
    async fn start() -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut held = Vec::new();
        while held.len() < 16 {
            match timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }

        Self {
            addr,
            _listener: listener,
            _held: held,
        }
    }
}

struct ForwarderHandle {
    addr: SocketAddr,
    _shutdown: CancellationToken,
}

async fn start_forwarder(to: Vec<String>, options: ForwardOptions) -> ForwarderHandle {
    let rule = Rule::new("test", "127.0.0.1:0", to);
    let forwarder = RuleForwarder::bind(rule, options).await.unwrap();
    let addr = forwarder.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(forwarder.serve(shutdown.clone()));
    ForwarderHandle {
        addr,
        _shutdown: shutdown,
    }
}

fn quiet() -> ForwardOptions {
    ForwardOptions {
        verbose: false,
        ..ForwardOptions::default()
    }
}

async fn echo_once(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    })
    .await
    .expect("echo through forwarder timed out")
}

/// Waits for the peer to close `stream`, counting a reset as closed.
async fn closed_within(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut buf = [0u8; 256];
    timeout(limit, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn spreads_connections_evenly_across_upstreams() {
    let upstreams = [
        EchoUpstream::start().await,
        EchoUpstream::start().await,
        EchoUpstream::start().await,
    ];
    let to = upstreams.iter().map(|u| u.addr.to_string()).collect();
    let forwarder = start_forwarder(
        to,
        ForwardOptions {
            seed: Some(7),
            ..quiet()
        },
    )
    .await;

    let connections = 900;
    for _ in 0..connections {
        assert_eq!(echo_once(forwarder.addr, b"x").await, b"x");
    }

    let expected = connections / upstreams.len();
    let total: usize = upstreams.iter().map(EchoUpstream::hits).sum();
    assert_eq!(total, connections);
    for upstream in &upstreams {
        let hits = upstream.hits();
        assert!(
            hits * 5 >= expected * 4 && hits * 5 <= expected * 6,
            "upstream {} got {hits} of {connections}",
            upstream.addr
        );
    }
}

#[tokio::test]
async fn unreachable_upstream_closes_client_within_dial_timeout() {
    let upstream = StalledUpstream::start().await;
    let dial_timeout = Duration::from_millis(300);
    let forwarder = start_forwarder(
        vec![upstream.addr.to_string()],
        ForwardOptions {
            dial_timeout,
            ..quiet()
        },
    )
    .await;

    let started = Instant::now();
    let mut client = TcpStream::connect(forwarder.addr).await.unwrap();
    assert!(closed_within(&mut client, dial_timeout + Duration::from_secs(1)).await);

    let elapsed = started.elapsed();
    assert!(elapsed >= dial_timeout, "closed before the dial timed out: {elapsed:?}");
    assert!(elapsed < dial_timeout + Duration::from_millis(500), "took {elapsed:?}");
}

#[tokio::test]
async fn refused_upstream_closes_client() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let forwarder = start_forwarder(vec![dead.to_string()], quiet()).await;

    let mut client = TcpStream::connect(forwarder.addr).await.unwrap();
    assert!(closed_within(&mut client, TEST_TIMEOUT).await);
}

#[tokio::test]
async fn upstream_dying_mid_transfer_closes_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"partial").await;
            // Dropping the socket simulates the upstream process dying.
        }
    });
    let forwarder = start_forwarder(vec![upstream.to_string()], quiet()).await;

    let mut client = TcpStream::connect(forwarder.addr).await.unwrap();
    client.write_all(b"start").await.unwrap();

    assert!(closed_within(&mut client, TEST_TIMEOUT).await);
}

#[tokio::test]
async fn single_upstream_receives_every_connection() {
    let upstream = EchoUpstream::start().await;
    let forwarder = start_forwarder(vec![upstream.addr.to_string()], quiet()).await;

    for i in 0..20u8 {
        assert_eq!(echo_once(forwarder.addr, &[i]).await, [i]);
    }
    assert_eq!(upstream.hits(), 20);
}

#[tokio::test]
async fn open_connection_does_not_block_new_ones() {
    let upstream = EchoUpstream::start().await;
    let forwarder = start_forwarder(vec![upstream.addr.to_string()], quiet()).await;

    let mut held = TcpStream::connect(forwarder.addr).await.unwrap();
    held.write_all(b"held").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, held.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    for _ in 0..5 {
        assert_eq!(echo_once(forwarder.addr, b"next").await, b"next");
    }

    held.write_all(b"more").await.unwrap();
    timeout(TEST_TIMEOUT, held.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"more");
}
