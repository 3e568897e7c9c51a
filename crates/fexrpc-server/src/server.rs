//! Per-connection dispatch engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use fexrpc_common::protocol::split_service_method;
use fexrpc_common::{
    CodecKind, FrameReader, FrameWriter, Header, Opt, OptEncoding, Result, RpcError,
};

use crate::service::{MethodType, Service};

/// RPC server: a service map plus the engine driving each connection.
///
/// Cloning is cheap and shares the service map, so one server can back any
/// number of listeners.
#[derive(Clone, Default)]
pub struct Server {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    // Insert-only after startup; reads vastly outnumber writes.
    services: RwLock<HashMap<String, Arc<Service>>>,
    opt_encoding: OptEncoding,
}

impl Server {
    pub fn new() -> Self {
        Server::default()
    }

    /// A server that reads the handshake envelope in the given encoding.
    /// Both ends of every connection must agree on it.
    pub fn with_opt_encoding(opt_encoding: OptEncoding) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                services: RwLock::new(HashMap::new()),
                opt_encoding,
            }),
        }
    }

    /// Registers a service under its name.
    ///
    /// Fails with [`RpcError::AlreadyRegistered`] when the name is bound.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.inner.services.write().expect("service map poisoned");
        if services.contains_key(service.name()) {
            return Err(RpcError::AlreadyRegistered(service.name().to_string()));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Services in name order, for the debug listing.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let services = self.inner.services.read().expect("service map poisoned");
        let mut list: Vec<_> = services.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    fn find_service(&self, service_method: &str) -> std::result::Result<Arc<MethodType>, String> {
        let (service_name, method_name) =
            split_service_method(service_method).map_err(|err| err.to_string())?;
        let service = {
            let services = self.inner.services.read().expect("service map poisoned");
            services.get(service_name).cloned()
        };
        let service =
            service.ok_or_else(|| format!("rpc server: can't find service {service_name}"))?;
        service
            .method_named(method_name)
            .ok_or_else(|| format!("rpc server: can't find method {method_name}"))
    }

    /// Accepts raw byte-stream connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(|err| {
                error!(error = %err, "rpc server: accept error");
                RpcError::from(err)
            })?;
            debug!(%peer, "rpc server: connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Drives one connection: handshake, then the codec loop.
    ///
    /// The stream is consumed; all exit paths release it.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        self.serve_conn_parts(BufReader::new(read_half), write_half)
            .await;
    }

    /// Handshake plus codec loop over pre-split halves. The buffered reader
    /// may already hold bytes (HTTP tunnel handshakes read through it).
    pub(crate) async fn serve_conn_parts<R, W>(&self, mut reader: BufReader<R>, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let opt = match Opt::read_from(&mut reader, self.inner.opt_encoding).await {
            Ok(opt) => opt,
            Err(err) => {
                warn!(error = %err, "rpc server: options error");
                return;
            }
        };
        if let Err(err) = opt.validate() {
            warn!(error = %err, "rpc server: rejecting connection");
            return;
        }
        self.serve_codec(
            FrameReader::from_buffered(reader, opt.codec),
            FrameWriter::new(writer, opt.codec),
            opt.handle_timeout,
        )
        .await;
    }

    /// The codec loop. Reads requests until the stream ends or breaks,
    /// spawning one handler task per well-formed request; waits for every
    /// spawned handler before closing the codec.
    async fn serve_codec<R, W>(
        &self,
        mut reader: FrameReader<R>,
        writer: FrameWriter<W>,
        handle_timeout: Duration,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let kind = reader.kind();
        let writer = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "rpc server: read header error");
                    break;
                }
            };
            // The body frame is consumed even when dispatch fails, so the
            // stream stays aligned for the next request.
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "rpc server: read body error");
                    let mut header = header;
                    header.error = err.to_string();
                    send_response(&writer, &header, &[]).await;
                    break;
                }
            };
            match self.find_service(&header.service_method) {
                Err(text) => {
                    let mut header = header;
                    header.error = text;
                    send_response(&writer, &header, &[]).await;
                }
                Ok(method) => {
                    handlers.spawn(handle_request(
                        Arc::clone(&writer),
                        kind,
                        header,
                        body,
                        method,
                        handle_timeout,
                    ));
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.shutdown().await;
    }
}

/// Runs one request to completion and emits exactly one response frame.
///
/// With a handle timeout, the invocation runs on its own task and races the
/// timer. When the timer wins, the timeout response is the terminal frame
/// for this sequence; the invocation still finishes in the background but
/// its result is dropped.
async fn handle_request<W>(
    writer: Arc<Mutex<FrameWriter<W>>>,
    kind: CodecKind,
    mut header: Header,
    body: Vec<u8>,
    method: Arc<MethodType>,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut invoked = tokio::spawn(async move { method.invoke(kind, body).await });

    let result = if handle_timeout.is_zero() {
        join_invocation(&mut invoked).await
    } else {
        tokio::select! {
            result = &mut invoked => flatten_invocation(result),
            _ = tokio::time::sleep(handle_timeout) => {
                header.error = format!(
                    "rpc server: request handle timeout: expect within {handle_timeout:?}"
                );
                send_response(&writer, &header, &[]).await;
                return;
            }
        }
    };

    match result {
        Ok(reply) => send_response(&writer, &header, &reply).await,
        Err(text) => {
            header.error = text;
            send_response(&writer, &header, &[]).await;
        }
    }
}

async fn join_invocation(
    invoked: &mut tokio::task::JoinHandle<std::result::Result<Vec<u8>, String>>,
) -> std::result::Result<Vec<u8>, String> {
    flatten_invocation(invoked.await)
}

fn flatten_invocation(
    joined: std::result::Result<std::result::Result<Vec<u8>, String>, tokio::task::JoinError>,
) -> std::result::Result<Vec<u8>, String> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(format!("rpc server: handler aborted: {err}")),
    }
}

/// Serializes response frames across all handler tasks of a connection.
async fn send_response<W>(writer: &Arc<Mutex<FrameWriter<W>>>, header: &Header, body: &[u8])
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write(header, body).await {
        error!(error = %err, "rpc server: write response error");
    }
}
