//! HTTP surface of the RPC server.
//!
//! Two paths share the listener: `CONNECT` on [`DEFAULT_RPC_PATH`] is
//! answered with the fixed `200 Connected` status line and hijacked into the
//! byte-stream protocol, and `GET` on [`DEFAULT_DEBUG_PATH`] serves a
//! human-readable listing of registered services with per-method call
//! counts.
//!
//! The tunnel handshake is spoken directly on the socket: its wire contract
//! fixes the exact status-line bytes, which rules out a general-purpose HTTP
//! stack for this path.

use std::fmt::Write as _;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use fexrpc_common::{Result, CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};

use crate::server::Server;

impl Server {
    /// Accepts HTTP-tunneled connections until the listener fails.
    pub async fn serve_http(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "rpc server: http connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.serve_http_conn(stream).await {
                    warn!(error = %err, "rpc server: http connection error");
                }
            });
        }
    }

    async fn serve_http_conn<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        // Drain the rest of the request head.
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        match (method.as_str(), path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                writer
                    .write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes())
                    .await?;
                // The connection now speaks the byte-stream protocol; bytes
                // the client pipelined behind its CONNECT stay in `reader`.
                self.serve_conn_parts(reader, writer).await;
                Ok(())
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let body = self.debug_html();
                write_http_response(&mut writer, "200 OK", "text/html; charset=utf-8", &body)
                    .await
            }
            (_, DEFAULT_RPC_PATH) => {
                write_http_response(
                    &mut writer,
                    "405 Method Not Allowed",
                    "text/plain; charset=utf-8",
                    "405 must CONNECT\n",
                )
                .await
            }
            _ => {
                write_http_response(
                    &mut writer,
                    "404 Not Found",
                    "text/plain; charset=utf-8",
                    "404 page not found\n",
                )
                .await
            }
        }
    }

    /// Renders the registered services and their call counts.
    pub fn debug_html(&self) -> String {
        let mut html = String::new();
        html.push_str("<html>\n<body>\n<title>Fex RPC Services</title>\n");
        for service in self.services() {
            let _ = writeln!(html, "<hr>\nService {}\n<hr>", service.name());
            html.push_str("<table>\n<th align=center>Method</th><th align=center>Calls</th>\n");
            for method in service.methods() {
                let _ = writeln!(
                    html,
                    "<tr><td align=left font=fixed>{}</td><td align=center>{}</td></tr>",
                    method.name(),
                    method.num_calls()
                );
            }
            html.push_str("</table>\n");
        }
        html.push_str("</body></html>\n");
        html
    }
}

async fn write_http_response<W>(
    writer: &mut W,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use fexrpc_common::{FrameReader, FrameWriter, Header, Opt, OptEncoding};
    use tokio::io::AsyncReadExt;

    fn foo_server() -> Server {
        let server = Server::new();
        server
            .register(Service::new("FooSvc").method(
                "Sum",
                |args: (i64, i64), reply: &mut i64| {
                    *reply = args.0 + args.1;
                    Ok(())
                },
            ))
            .unwrap();
        server
    }

    fn spawn_http(server: &Server) -> tokio::io::DuplexStream {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve_http_conn(remote).await;
        });
        local
    }

    #[tokio::test]
    async fn connect_tunnels_into_the_rpc_protocol() {
        let server = foo_server();
        let mut stream = spawn_http(&server);

        stream
            .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
            .await
            .unwrap();

        let mut status = vec![0u8; CONNECTED.len() + "HTTP/1.0 \n\n".len()];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(status, format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes());

        // The tunnel now carries the ordinary handshake and codec loop.
        let opt = Opt::default();
        opt.write_to(&mut stream, OptEncoding::Binary).await.unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, opt.codec);
        let mut writer = FrameWriter::new(write_half, opt.codec);

        let body = opt.codec.to_vec(&(20i64, 22i64)).unwrap();
        writer
            .write(&Header::request("FooSvc.Sum", 1), &body)
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap().unwrap();
        assert!(header.error.is_empty());
        let reply: i64 = opt.codec.from_slice(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(reply, 42);
    }

    #[tokio::test]
    async fn get_on_rpc_path_is_rejected() {
        let server = foo_server();
        let mut stream = spawn_http(&server);
        stream
            .write_all(format!("GET {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 405"));
        assert!(response.contains("must CONNECT"));
    }

    #[tokio::test]
    async fn debug_page_lists_services_and_counts() {
        let server = foo_server();
        let mut stream = spawn_http(&server);
        stream
            .write_all(format!("GET {DEFAULT_DEBUG_PATH} HTTP/1.0\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 200"));
        assert!(response.contains("FooSvc"));
        assert!(response.contains("Sum"));
    }
}
