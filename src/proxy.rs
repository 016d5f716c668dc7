use anyhow::{Context, Result, anyhow, bail};
use rustls::pki_types::ServerName;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::{Host, Position, Url};

use crate::{
    engine::DecisionEngine,
    forwarded::{X_CF_FORWARDED_URL, X_FORWARDED_FOR},
};

pub const MAX_HEAD_SIZE: usize = 16 * 1024;
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADERS: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

const SERVICE_UNAVAILABLE: &str = "503 Service Unavailable";
const BAD_GATEWAY: &str = "502 Bad Gateway";
const BAD_REQUEST: &str = "400 Bad Request";

/// Headers the route service sets itself on the forwarded request.
const REPLACED_HEADERS: [&str; 4] = ["host", "connection", "keep-alive", "proxy-connection"];

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Executes engine verdicts for inbound connections.
pub struct RouteService {
    engine: DecisionEngine,
    tls: Option<TlsConnector>,
}

impl RouteService {
    #[must_use]
    pub fn new(engine: DecisionEngine, tls: Option<rustls::ClientConfig>) -> Self {
        Self {
            engine,
            tls: tls.map(|config| TlsConnector::from(Arc::new(config))),
        }
    }

    async fn connect_upstream(&self, target: &Url) -> Result<Box<dyn UpstreamIo>> {
        let connector = match target.scheme() {
            "http" => None,
            "https" => Some(self.tls.as_ref().ok_or_else(|| {
                anyhow!("https forwarded URL requires an upstream CA bundle (upstream.ca_file)")
            })?),
            other => bail!("Unsupported forwarded URL scheme: {other}"),
        };

        let host = match target.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => bail!("Forwarded URL has no host: {target}"),
        };
        let port = target
            .port_or_known_default()
            .ok_or_else(|| anyhow!("Forwarded URL has no port: {target}"))?;
        let upstream_addr = &target[Position::BeforeHost..Position::AfterPort];

        debug!(upstream_addr, "Connecting to forwarded URL");
        let tcp_stream = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("Failed to connect to upstream {upstream_addr}"))?;

        let Some(connector) = connector else {
            return Ok(Box::new(tcp_stream));
        };
        let server_name = ServerName::try_from(host.as_str())
            .map(|name| name.to_owned())
            .with_context(|| format!("Invalid TLS server name for {upstream_addr}"))?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake with upstream {upstream_addr} failed"))?;
        Ok(Box::new(tls_stream))
    }
}

/// Request line and headers of one HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Returns the head and its length in bytes, or `None` if `buf` holds only part of it.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf)? {
            httparse::Status::Complete(head_len) => {
                let head = Self {
                    method: req.method.unwrap_or("GET").to_string(),
                    target: req.path.unwrap_or("/").to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|header| (header.name.to_string(), header.value.to_vec()))
                        .collect(),
                };
                Ok(Some((head, head_len)))
            }
            httparse::Status::Partial => Ok(None),
        }
    }

    /// All values of a header, in order. Values that are not UTF-8 are skipped.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case(name))
            .filter_map(|(_, value)| std::str::from_utf8(value).ok())
            .collect()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }

    /// Serializes the head for the forwarded URL: its path and query become the
    /// request target, its authority the Host. Other headers pass through as-is.
    #[must_use]
    pub fn rewrite_for(&self, target: &Url) -> Vec<u8> {
        let path_and_query = &target[Position::BeforePath..Position::AfterQuery];
        let authority = &target[Position::BeforeHost..Position::AfterPort];

        let mut out = format!(
            "{} {} HTTP/1.{}\r\n",
            self.method, path_and_query, self.version
        )
        .into_bytes();
        for (name, value) in &self.headers {
            if REPLACED_HEADERS
                .iter()
                .any(|replaced| name.eq_ignore_ascii_case(replaced))
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("host: {authority}\r\nconnection: close\r\n\r\n").as_bytes());
        out
    }
}

/// Reads until a full request head is buffered. Returns the head and any body
/// bytes read past it, or `None` if the client closed before sending anything.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<(RequestHead, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request head")?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("Connection closed in the middle of the request head");
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, head_len)) =
            RequestHead::parse(&buf).context("Malformed request head")?
        {
            let body = buf.split_off(head_len);
            return Ok(Some((head, body)));
        }
        if buf.len() > MAX_HEAD_SIZE {
            bail!("Request head exceeds {MAX_HEAD_SIZE} bytes");
        }
    }
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
    stream
        .write_all(response.as_bytes())
        .await
        .context("Failed to write response")?;
    stream.shutdown().await.context("Failed to close connection")?;
    Ok(())
}

/// Handles one inbound connection: one request, one verdict.
pub async fn handle_connection<S>(mut stream: S, service: &RouteService) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(read) = timeout(HEAD_READ_TIMEOUT, read_request_head(&mut stream)).await else {
        bail!("Timed out waiting for request head");
    };
    let (head, body) = match read {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("Client closed before sending a request");
            return Ok(());
        }
        Err(e) => {
            respond(&mut stream, BAD_REQUEST).await?;
            return Err(e);
        }
    };

    let forwarded_for = head.header_values(X_FORWARDED_FOR);
    let forwarded_url = head.header(X_CF_FORWARDED_URL);
    let decision = service.engine.evaluate(&forwarded_for, forwarded_url);
    if !decision.is_allowed() {
        return respond(&mut stream, SERVICE_UNAVAILABLE).await;
    }

    let Some(forwarded_url) = forwarded_url else {
        warn!("Allowed request has no {X_CF_FORWARDED_URL} header, nothing to forward");
        return respond(&mut stream, SERVICE_UNAVAILABLE).await;
    };
    let target = match Url::parse(forwarded_url.trim()) {
        Ok(target) => target,
        Err(e) => {
            respond(&mut stream, BAD_GATEWAY).await?;
            return Err(anyhow::Error::new(e).context(format!("Cannot forward to '{forwarded_url}'")));
        }
    };
    let mut upstream = match service.connect_upstream(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            respond(&mut stream, BAD_GATEWAY).await?;
            return Err(e);
        }
    };

    info!(method = %head.method, forwarded_url = %target, "Forwarding request");
    upstream
        .write_all(&head.rewrite_for(&target))
        .await
        .context("Failed to send request head upstream")?;
    if !body.is_empty() {
        upstream
            .write_all(&body)
            .await
            .context("Failed to send request body upstream")?;
    }

    let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut stream, &mut upstream)
        .await
        .context("Relay between client and upstream failed")?;
    debug!(
        bytes_to_upstream = to_upstream + body.len() as u64,
        bytes_to_client = to_client,
        "Proxy connection closed"
    );
    Ok(())
}

/// Accepts connections until the listener fails, one task per connection.
pub async fn serve(listener: TcpListener, service: Arc<RouteService>) -> Result<()> {
    while let Ok((stream, client_addr)) = listener.accept().await {
        let service = Arc::clone(&service);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(stream, &service).await {
                    error!(error = %format!("{e:#}"), "Connection failed");
                }
            }
            .instrument(info_span!("connection", client_addr = %client_addr)),
        );
    }

    Ok(())
}
