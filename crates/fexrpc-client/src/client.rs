//! Connection-multiplexed RPC client.
//!
//! One [`Client`] owns one connection. Callers register calls into a
//! pending table keyed by sequence number and write request frames under a
//! sending lock; a dedicated receive task reads response frames and
//! completes the matching calls, in whatever order the server produced
//! them. Lock order is fixed: sending lock before the coordination lock;
//! only connection teardown holds both.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use fexrpc_common::{
    CodecKind, FrameReader, FrameWriter, Header, Opt, OptEncoding, Result, RpcError, CONNECTED,
    DEFAULT_RPC_PATH,
};

use crate::call::Call;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// What the receive loop delivers to a pending call.
pub(crate) enum Outcome {
    /// Raw response body, still encoded.
    Reply(Vec<u8>),
    Error(RpcError),
}

/// A registered call waiting for its response. The completer is `FnOnce`,
/// so the completion signal cannot fire twice.
pub(crate) struct Pending {
    complete: Box<dyn FnOnce(Outcome) + Send>,
}

impl Pending {
    fn fire(self, outcome: Outcome) {
        (self.complete)(outcome);
    }
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, Pending>,
    /// Set by `close`, user initiated.
    closing: bool,
    /// Set by teardown after a connection error.
    shutdown: bool,
}

pub(crate) struct ClientInner {
    kind: CodecKind,
    target: String,
    /// Sending lock: serializes request frames into the codec.
    writer: tokio::sync::Mutex<FrameWriter<BoxedWrite>>,
    /// Coordination lock: pending table, sequence counter and flags.
    /// Never held across an await point.
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn register_call(&self, pending: Pending) -> std::result::Result<u64, Pending> {
        let mut state = self.state.lock().expect("client state poisoned");
        if state.closing || state.shutdown {
            return Err(pending);
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, pending);
        Ok(seq)
    }

    pub(crate) fn remove_call(&self, seq: u64) -> Option<Pending> {
        let mut state = self.state.lock().expect("client state poisoned");
        state.pending.remove(&seq)
    }

    /// Connection teardown: fail every pending call and refuse new ones.
    /// Takes the sending lock first, then the coordination lock.
    async fn terminate_calls(&self, err: &RpcError) {
        let _sending = self.writer.lock().await;
        let mut state = self.state.lock().expect("client state poisoned");
        state.shutdown = true;
        let message = err.to_string();
        for (_, pending) in state.pending.drain() {
            pending.fire(Outcome::Error(RpcError::Protocol(message.clone())));
        }
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock().expect("client state poisoned");
        !state.closing && !state.shutdown
    }
}

/// Handle to one multiplexed connection. Cloning shares the connection;
/// all clones observe the same shutdown.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Dials a raw TCP endpoint with the default handshake encoding.
    pub async fn dial(addr: &str, opt: Opt) -> Result<Client> {
        Client::dial_with(addr, opt, OptEncoding::default()).await
    }

    /// Dials a raw TCP endpoint, sending the handshake in `encoding`.
    pub async fn dial_with(addr: &str, opt: Opt, encoding: OptEncoding) -> Result<Client> {
        dial_timeout(move |stream, opt| new_client(stream, opt, encoding), addr, opt).await
    }

    /// Dials through the HTTP `CONNECT` tunnel.
    pub async fn dial_http(addr: &str, opt: Opt) -> Result<Client> {
        Client::dial_http_with(addr, opt, OptEncoding::default()).await
    }

    pub async fn dial_http_with(addr: &str, opt: Opt, encoding: OptEncoding) -> Result<Client> {
        dial_timeout(
            move |stream, opt| new_http_client(stream, opt, encoding),
            addr,
            opt,
        )
        .await
    }

    /// Dials a `protocol@address` endpoint: `http` tunnels over TCP, `unix`
    /// uses a unix-domain stream, anything else is raw TCP.
    pub async fn x_dial(rpc_addr: &str, opt: Opt) -> Result<Client> {
        let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
            RpcError::Protocol(format!(
                "rpc client error: wrong format: '{rpc_addr}', expect protocol@addr"
            ))
        })?;
        match protocol {
            "http" => Client::dial_http(addr, opt).await,
            #[cfg(unix)]
            "unix" => Client::dial_unix(addr, opt).await,
            _ => Client::dial(addr, opt).await,
        }
    }

    /// Dials a unix-domain socket endpoint.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opt: Opt) -> Result<Client> {
        let connect_and_shake = async {
            let stream = tokio::net::UnixStream::connect(path).await?;
            new_client_stream(stream, opt, path.to_string(), OptEncoding::default()).await
        };
        if opt.connect_timeout.is_zero() {
            connect_and_shake.await
        } else {
            match tokio::time::timeout(opt.connect_timeout, connect_and_shake).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::ConnectTimeout(opt.connect_timeout)),
            }
        }
    }

    /// Remote address this client dialed.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// False once the client is closing or has shut down.
    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    /// Starts an asynchronous invocation and returns its [`Call`] handle
    /// immediately. Failures to register or send are delivered through the
    /// handle's completion signal, never lost.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let kind = self.inner.kind;
        let pending = Pending {
            complete: Box::new(move |outcome| {
                let result = match outcome {
                    Outcome::Reply(body) => kind
                        .from_slice::<R>(&body)
                        .map_err(|err| RpcError::Protocol(format!("reading body: {err}"))),
                    Outcome::Error(err) => Err(err),
                };
                // The receiver may already be gone (cancelled caller).
                let _ = tx.send(result);
            }),
        };

        let body = match kind.to_vec(args) {
            Ok(body) => body,
            Err(err) => {
                pending.fire(Outcome::Error(err));
                return Call::new(0, service_method.to_string(), rx, Weak::new());
            }
        };

        let seq = match self.inner.register_call(pending) {
            Ok(seq) => seq,
            Err(pending) => {
                pending.fire(Outcome::Error(RpcError::ShutDown));
                return Call::new(0, service_method.to_string(), rx, Weak::new());
            }
        };

        let header = Header::request(service_method, seq);
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write(&header, &body).await {
                drop(writer);
                if let Some(pending) = self.inner.remove_call(seq) {
                    pending.fire(Outcome::Error(err));
                }
            }
        }
        Call::new(seq, service_method.to_string(), rx, Arc::downgrade(&self.inner))
    }

    /// Synchronous invocation: [`go`](Client::go) plus waiting on the
    /// completion signal.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.go(service_method, args).await.done().await
    }

    /// Synchronous invocation raced against a deadline. When the deadline
    /// wins the call withdraws from the pending table; a response arriving
    /// later is discarded by the receive loop.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: std::time::Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        if timeout.is_zero() {
            return self.call(service_method, args).await;
        }
        let call = self.go(service_method, args).await;
        match tokio::time::timeout(timeout, call.done()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::CallFailed("deadline has elapsed".to_string())),
        }
    }

    /// Closes the connection. The first close wins; every later close
    /// returns [`RpcError::ShutDown`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("client state poisoned");
            if state.closing {
                return Err(RpcError::ShutDown);
            }
            state.closing = true;
        }
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await
    }

    /// Assembles a client from split halves, spawning the receive task.
    /// The handshake envelope must already be on the wire.
    fn from_parts<R>(reader: BufReader<R>, writer: BoxedWrite, opt: Opt, target: String) -> Client
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let inner = Arc::new(ClientInner {
            kind: opt.codec,
            target,
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer, opt.codec)),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let receive_inner = Arc::clone(&inner);
        tokio::spawn(receive(
            receive_inner,
            FrameReader::from_buffered(reader, opt.codec),
        ));
        Client { inner }
    }
}

/// Receive loop: one long-lived task per client. Exits on the first framing
/// error and terminates every pending call.
async fn receive<R>(inner: Arc<ClientInner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Send + Unpin,
{
    let err = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break RpcError::Protocol("connection closed by peer".to_string()),
            Err(err) => break err,
        };
        match inner.remove_call(header.seq) {
            // Call already withdrawn (cancelled); consume the body to keep
            // the framing aligned.
            None => {
                if let Err(err) = reader.read_body().await {
                    break err;
                }
            }
            Some(pending) if !header.error.is_empty() => {
                let body = reader.read_body().await;
                pending.fire(Outcome::Error(RpcError::Remote(header.error)));
                if let Err(err) = body {
                    break err;
                }
            }
            Some(pending) => match reader.read_body().await {
                Ok(body) => pending.fire(Outcome::Reply(body)),
                Err(err) => {
                    pending.fire(Outcome::Error(RpcError::Protocol(format!(
                        "reading body: {err}"
                    ))));
                    break err;
                }
            },
        }
    };
    debug!(peer = %inner.target, error = %err, "rpc client: receive loop ended");
    inner.terminate_calls(&err).await;
}

/// Connects with the connect-timeout budget, then races the handshake
/// against the same budget. A handshake that completes after losing the
/// race has its client closed so the connection doesn't leak.
async fn dial_timeout<F, Fut>(new_fn: F, addr: &str, opt: Opt) -> Result<Client>
where
    F: FnOnce(TcpStream, Opt) -> Fut,
    Fut: Future<Output = Result<Client>> + Send + 'static,
{
    let stream = if opt.connect_timeout.is_zero() {
        TcpStream::connect(addr).await?
    } else {
        match tokio::time::timeout(opt.connect_timeout, TcpStream::connect(addr)).await {
            Ok(connected) => connected?,
            Err(_) => return Err(RpcError::ConnectTimeout(opt.connect_timeout)),
        }
    };

    let mut handshake = tokio::spawn(new_fn(stream, opt));
    if opt.connect_timeout.is_zero() {
        return join_handshake(handshake.await);
    }
    tokio::select! {
        joined = &mut handshake => join_handshake(joined),
        _ = tokio::time::sleep(opt.connect_timeout) => {
            tokio::spawn(async move {
                if let Ok(Ok(client)) = handshake.await {
                    warn!("rpc client: closing connection from late handshake");
                    let _ = client.close().await;
                }
            });
            Err(RpcError::ConnectTimeout(opt.connect_timeout))
        }
    }
}

fn join_handshake(
    joined: std::result::Result<Result<Client>, tokio::task::JoinError>,
) -> Result<Client> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(RpcError::Protocol(format!("handshake aborted: {err}"))),
    }
}

async fn new_client(stream: TcpStream, opt: Opt, encoding: OptEncoding) -> Result<Client> {
    let target = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    new_client_stream(stream, opt, target, encoding).await
}

/// Sends the handshake envelope and assembles the client.
async fn new_client_stream<S>(
    stream: S,
    opt: Opt,
    target: String,
    encoding: OptEncoding,
) -> Result<Client>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    opt.write_to(&mut write_half, encoding).await?;
    Ok(Client::from_parts(
        BufReader::new(read_half),
        Box::new(write_half),
        opt,
        target,
    ))
}

/// Performs the `CONNECT` tunnel handshake, then behaves like `new_client`.
async fn new_http_client(stream: TcpStream, opt: Opt, encoding: OptEncoding) -> Result<Client> {
    let target = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (read_half, mut write_half) = tokio::io::split(stream);
    write_half
        .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
        .await?;

    let mut reader = BufReader::new(read_half);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let expected = format!("HTTP/1.0 {CONNECTED}");
    if status_line.trim_end() != expected {
        return Err(RpcError::Handshake(format!(
            "unexpected HTTP response: {}",
            status_line.trim_end()
        )));
    }
    let mut blank = String::new();
    reader.read_line(&mut blank).await?;

    opt.write_to(&mut write_half, encoding).await?;
    Ok(Client::from_parts(
        reader,
        Box::new(write_half),
        opt,
        target,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fexrpc_server::{Server, Service};
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Serialize, Deserialize, Clone, Copy)]
    struct BarArgs {
        delay_ms: u64,
    }

    async fn start_bar_server() -> String {
        let server = Server::new();
        server
            .register(
                Service::new("Bar")
                    .method("Echo", |args: BarArgs, reply: &mut u64| {
                        *reply = args.delay_ms;
                        Ok(())
                    })
                    .method_async("Timeout", |args: BarArgs| async move {
                        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
                        Ok(args.delay_ms)
                    }),
            )
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn call_round_trips() {
        let addr = start_bar_server().await;
        let client = Client::dial(&addr, Opt::default()).await.unwrap();
        let reply: u64 = client
            .call("Bar.Echo", &BarArgs { delay_ms: 42 })
            .await
            .unwrap();
        assert_eq!(reply, 42);
    }

    #[tokio::test]
    async fn concurrent_calls_demultiplex() {
        let addr = start_bar_server().await;
        let client = Client::dial(&addr, Opt::default()).await.unwrap();

        // The slow call is issued first but must not block the fast one.
        let slow = client
            .go::<_, u64>("Bar.Timeout", &BarArgs { delay_ms: 200 })
            .await;
        let fast = client
            .go::<_, u64>("Bar.Echo", &BarArgs { delay_ms: 7 })
            .await;
        assert!(slow.seq() < fast.seq());

        let started = std::time::Instant::now();
        assert_eq!(fast.done().await.unwrap(), 7);
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(slow.done().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn caller_deadline_wins_the_race() {
        let addr = start_bar_server().await;
        let client = Client::dial(&addr, Opt::default()).await.unwrap();
        let err = client
            .call_timeout::<_, u64>(
                "Bar.Timeout",
                &BarArgs { delay_ms: 500 },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("call failed"), "{err}");

        // The connection survives the cancelled call; the late response is
        // discarded by the receive loop.
        let reply: u64 = client
            .call("Bar.Echo", &BarArgs { delay_ms: 1 })
            .await
            .unwrap();
        assert_eq!(reply, 1);
    }

    #[tokio::test]
    async fn server_handle_timeout_is_reported() {
        let addr = start_bar_server().await;
        let opt = Opt {
            handle_timeout: Duration::from_millis(50),
            ..Opt::default()
        };
        let client = Client::dial(&addr, opt).await.unwrap();
        let err = client
            .call::<_, u64>("Bar.Timeout", &BarArgs { delay_ms: 500 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handle timeout"), "{err}");
    }

    #[tokio::test]
    async fn double_close_returns_shutdown() {
        let addr = start_bar_server().await;
        let client = Client::dial(&addr, Opt::default()).await.unwrap();
        assert!(client.is_available());
        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(
            client.close().await.unwrap_err(),
            RpcError::ShutDown
        ));
    }

    #[tokio::test]
    async fn go_after_close_fails_with_shutdown() {
        let addr = start_bar_server().await;
        let client = Client::dial(&addr, Opt::default()).await.unwrap();
        client.close().await.unwrap();
        let err = client
            .call::<_, u64>("Bar.Echo", &BarArgs { delay_ms: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ShutDown));
    }

    #[tokio::test]
    async fn pending_calls_fail_when_the_server_dies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let serving = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Drop the connection while a call is in flight.
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        });

        let client = Client::dial(&addr, Opt::default()).await.unwrap();
        let err = client
            .call::<_, u64>("Bar.Timeout", &BarArgs { delay_ms: 5000 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)), "{err}");
        serving.await.unwrap();
        assert!(!client.is_available());
    }

    mod dialing {
        use super::*;

        async fn slow_handshake(stream: TcpStream, opt: Opt) -> Result<Client> {
            drop(stream);
            tokio::time::sleep(Duration::from_millis(300)).await;
            let (local, _remote) = tokio::io::duplex(64);
            let (read_half, write_half) = tokio::io::split(local);
            Ok(Client::from_parts(
                BufReader::new(read_half),
                Box::new(write_half),
                opt,
                "test".to_string(),
            ))
        }

        #[tokio::test]
        async fn budget_covers_the_handshake() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let opt = Opt {
                connect_timeout: Duration::from_millis(50),
                ..Opt::default()
            };
            let err = dial_timeout(slow_handshake, &addr, opt).await.unwrap_err();
            assert!(err.to_string().contains("connect timeout"), "{err}");
        }

        #[tokio::test]
        async fn zero_means_no_limit() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let opt = Opt {
                connect_timeout: Duration::ZERO,
                ..Opt::default()
            };
            assert!(dial_timeout(slow_handshake, &addr, opt).await.is_ok());
        }
    }

    #[tokio::test]
    async fn x_dial_rejects_malformed_endpoints() {
        let err = Client::x_dial("no-protocol-marker", Opt::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expect protocol@addr"));
    }
}
