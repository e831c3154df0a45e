use anyhow::Result;
use clap::Parser;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use reqwest::{Client, Method, Response, redirect};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{Message as WsMessage, protocol::WebSocketConfig},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnelhub_common::{
    Body, ErrorCode, Handshake, Message, RequestFrame, ResponseFrame, TunnelError,
    constants::{
        HEARTBEAT_INTERVAL_SECS, MAX_BODY_SIZE_BYTES, RECONNECT_MAX_DELAY_MS,
        RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER, max_ws_message_size,
    },
    generate_tunnel_id, headers_to_map, map_to_headers, strip_request_headers,
    strip_response_headers,
    validation::validate_tunnel_id,
};
use url::Url;

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// CLI arguments for the host agent
#[derive(Parser, Debug)]
#[command(name = "tunnelhub")]
#[command(about = "Expose a local HTTP server through a tunnelhub broker", long_about = None)]
#[command(version)]
struct Args {
    /// Local port to forward requests to
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Local host address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker URL (ws://, wss://, http:// or https://)
    #[arg(
        short,
        long,
        env = "TUNNELHUB_SERVER",
        default_value = "ws://localhost:3000/ws"
    )]
    server: String,

    /// Tunnel ID to register; a random one is generated when omitted
    #[arg(long, env = "TUNNELHUB_ID")]
    id: Option<String>,

    /// Require this password (HTTP Basic) for every public request
    #[arg(long, env = "TUNNELHUB_PASSWORD")]
    password: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Timeout for calls to the local server in seconds
    #[arg(long, default_value = "55")]
    request_timeout: u64,

    /// Maximum request/response body size in MB; must match the broker
    #[arg(long, default_value_t = MAX_BODY_SIZE_BYTES / (1024 * 1024))]
    max_payload_mb: usize,
}

/// Configuration for the host agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Local service address (e.g., "http://127.0.0.1:3000")
    pub local_address: String,

    /// Broker WebSocket endpoint
    pub websocket_url: String,

    pub tunnel_id: String,
    pub password: Option<String>,

    pub connect_timeout: Duration,

    /// Request timeout when calling local service
    pub request_timeout: Duration,

    /// Largest body relayed in either direction
    pub max_body_size: usize,

    pub heartbeat_interval: Duration,

    pub reconnect_config: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    /// Delay to use after `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.multiplier;
        Duration::from_millis(next.min(self.max_delay.as_millis() as f64) as u64)
    }
}

impl Config {
    fn from_args(args: Args) -> Result<Self> {
        let tunnel_id = args.id.unwrap_or_else(generate_tunnel_id);
        validate_tunnel_id(&tunnel_id)?;

        Ok(Self {
            local_address: format!("http://{}:{}", args.host, args.port),
            websocket_url: websocket_url(&args.server)?,
            tunnel_id,
            password: args.password.filter(|p| !p.is_empty()),
            connect_timeout: Duration::from_secs(args.connect_timeout),
            request_timeout: Duration::from_secs(args.request_timeout),
            max_body_size: args.max_payload_mb.max(1) * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            reconnect_config: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
                max_attempts: None, // Infinite retries
            },
        })
    }
}

/// Turn a broker address into its WebSocket endpoint
///
/// `http(s)` becomes `ws(s)`, and a bare host gets the `/ws` path.
fn websocket_url(server: &str) -> Result<String> {
    let mut url = Url::parse(server)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("Unsupported broker URL scheme: {}", other),
    };
    if url.set_scheme(scheme).is_err() {
        anyhow::bail!("Invalid broker URL: {}", server);
    }
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }

    Ok(url.to_string())
}

/// WebSocket limits large enough for any request the broker relays
fn websocket_config(max_body_size: usize) -> WebSocketConfig {
    let limit = max_ws_message_size(max_body_size);
    WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit))
}

/// The local server requests are forwarded to
#[derive(Debug, Clone)]
struct LocalService {
    client: Client,
    address: String,
    max_body_size: usize,
}

/// What the broker told us when it accepted the tunnel
#[derive(Debug, Clone)]
struct Established {
    connection_id: String,
    public_url: String,
    dashboard_url: Option<String>,
    password_protected: bool,
}

/// Connection manager handles WebSocket lifecycle and reconnection
pub struct ConnectionManager {
    config: Config,
    local: LocalService,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        let local = LocalService {
            client,
            address: config.local_address.clone(),
            max_body_size: config.max_body_size,
        };
        Ok(Self { config, local })
    }

    /// Main run loop with automatic reconnection
    ///
    /// Returns only when the tunnel ID is taken by another host.
    pub async fn run(&self) -> Result<()> {
        let reconnect = &self.config.reconnect_config;
        let mut reconnect_delay = reconnect.min_delay;
        let mut attempt = 0;

        loop {
            match self.establish_connection().await {
                Ok((ws_stream, established)) => {
                    print_banner(&self.config, &established);
                    reconnect_delay = reconnect.min_delay;
                    attempt = 0;

                    // Handle the connection until it drops
                    self.handle_connection(ws_stream).await;
                    warn!("Connection {} lost", established.connection_id);
                }
                Err(TunnelError::TunnelConflict(message)) => {
                    error!("{}", message);
                    return Err(TunnelError::TunnelConflict(message).into());
                }
                Err(e) => {
                    error!("Failed to connect: {}", e);
                }
            }

            attempt += 1;
            if reconnect.max_attempts.is_some_and(|max| attempt > max) {
                anyhow::bail!("Giving up after {} reconnection attempts", attempt - 1);
            }

            info!(
                "Reconnecting in {:?} (attempt {})",
                reconnect_delay, attempt
            );
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = reconnect.next_delay(reconnect_delay);
        }
    }

    /// Establish WebSocket connection and register the tunnel
    async fn establish_connection(&self) -> Result<(WebSocket, Established), TunnelError> {
        debug!("Connecting to {}", self.config.websocket_url);

        let (mut ws_stream, _) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async_with_config(
                self.config.websocket_url.as_str(),
                Some(websocket_config(self.config.max_body_size)),
                false,
            ),
        )
        .await
        .map_err(|_| TunnelError::Timeout)?
        .map_err(|e| TunnelError::ConnectionError(e.to_string()))?;

        let register = Message::Register(Handshake::host(
            self.config.tunnel_id.clone(),
            self.config.password.clone(),
        ));
        let register_json = serde_json::to_string(&register)?;
        ws_stream
            .send(WsMessage::Text(register_json.into()))
            .await
            .map_err(|e| TunnelError::WebSocketError(format!("Failed to register: {}", e)))?;

        debug!("Sent register for {}, waiting for confirmation", self.config.tunnel_id);

        let handshake = tokio::time::timeout(self.config.connect_timeout, async {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                        Ok(Message::ConnectionEstablished {
                            connection_id,
                            public_url,
                            dashboard_url,
                            password_protected,
                            ..
                        }) => {
                            return Ok(Established {
                                connection_id,
                                public_url,
                                dashboard_url,
                                password_protected,
                            });
                        }
                        Ok(Message::Error {
                            code: ErrorCode::TunnelConflict,
                            message,
                            ..
                        }) => {
                            return Err(TunnelError::TunnelConflict(message));
                        }
                        Ok(Message::Error { code, message, .. }) => {
                            return Err(TunnelError::ConnectionError(format!(
                                "Broker refused registration ({}): {}",
                                code, message
                            )));
                        }
                        Ok(other) => debug!("Ignoring {} during handshake", other.kind()),
                        Err(e) => warn!("Unparseable frame during handshake: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => {
                        return Err(TunnelError::ConnectionError(
                            "Server closed connection during handshake".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(TunnelError::WebSocketError(e.to_string()));
                    }
                    _ => {}
                }
            }
            Err(TunnelError::ConnectionError(
                "Connection closed before handshake".to_string(),
            ))
        });

        let established = handshake.await.map_err(|_| TunnelError::Timeout)??;
        Ok((ws_stream, established))
    }

    /// Handle active WebSocket connection with split read/write tasks
    async fn handle_connection(&self, ws_stream: WebSocket) {
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(100);

        let mut write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));
        let mut read_handle = tokio::spawn(spawn_read_task(
            read,
            outgoing_tx.clone(),
            self.local.clone(),
        ));
        let mut heartbeat_handle = tokio::spawn(spawn_heartbeat_task(
            outgoing_tx,
            self.config.heartbeat_interval,
        ));

        // Wait for any task to complete (usually means connection dropped)
        tokio::select! {
            result = &mut write_handle => debug!("Write task ended: {:?}", result),
            result = &mut read_handle => debug!("Read task ended: {:?}", result),
            result = &mut heartbeat_handle => debug!("Heartbeat task ended: {:?}", result),
        }

        write_handle.abort();
        read_handle.abort();
        heartbeat_handle.abort();
    }
}

fn print_banner(config: &Config, established: &Established) {
    info!("Tunnel established");
    info!("  Tunnel ID:     {}", config.tunnel_id);
    info!("  Public URL:    {}", established.public_url);
    if let Some(dashboard) = &established.dashboard_url {
        info!("  Dashboard:     {}", dashboard);
    }
    info!("  Forwarding to: {}", config.local_address);
    if established.password_protected {
        info!("  Password protection enabled");
    }
    debug!("  Connection ID: {}", established.connection_id);
}

/// Write task sends outgoing messages through WebSocket
async fn spawn_write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }

    debug!("Write task exiting");
}

/// Read task receives incoming messages and dispatches them
async fn spawn_read_task(
    mut read: SplitStream<WebSocket>,
    outgoing_tx: mpsc::Sender<WsMessage>,
    local: LocalService,
) {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) = handle_text_message(&text, &outgoing_tx, &local) {
                    error!("Error handling message: {}", e);
                }
            }
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
            }
            Ok(WsMessage::Ping(data)) => {
                debug!("Received WebSocket ping");
                if let Err(e) = outgoing_tx.send(WsMessage::Pong(data)).await {
                    error!("Failed to send pong: {}", e);
                    break;
                }
            }
            Ok(WsMessage::Pong(_)) => {
                debug!("Received WebSocket pong");
            }
            Ok(WsMessage::Close(frame)) => {
                info!("Server closed connection: {:?}", frame);
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    debug!("Read task exiting");
}

/// Handle incoming text messages
fn handle_text_message(
    text: &str,
    outgoing_tx: &mpsc::Sender<WsMessage>,
    local: &LocalService,
) -> Result<(), TunnelError> {
    let message: Message = serde_json::from_str(text)
        .map_err(|e| TunnelError::InvalidMessage(format!("Failed to parse message: {}", e)))?;

    match message {
        Message::HttpRequest(request) => {
            debug!("Received HTTP request: {} {}", request.method, request.path);

            // Spawn a new task to handle this request concurrently
            let local = local.clone();
            let outgoing_tx = outgoing_tx.clone();

            tokio::spawn(async move {
                let reply = forward_to_local(&local, request).await;
                if let Err(e) = send_message(&outgoing_tx, &reply).await {
                    error!("Failed to send response: {}", e);
                }
            });
        }

        Message::Ping => {
            send_now(outgoing_tx, &Message::Pong)?;
        }

        Message::Pong => {
            debug!("Received pong");
        }

        Message::Error {
            request_id,
            code,
            message,
        } => {
            error!(
                "Server error: {} - {} (request_id: {:?})",
                code, message, request_id
            );
        }

        other => {
            warn!("Received unexpected message type: {}", other.kind());
        }
    }

    Ok(())
}

async fn send_message(
    outgoing_tx: &mpsc::Sender<WsMessage>,
    message: &Message,
) -> Result<(), TunnelError> {
    let json = serde_json::to_string(message)?;
    outgoing_tx
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| TunnelError::WebSocketError(e.to_string()))
}

fn send_now(outgoing_tx: &mpsc::Sender<WsMessage>, message: &Message) -> Result<(), TunnelError> {
    let json = serde_json::to_string(message)?;
    outgoing_tx
        .try_send(WsMessage::Text(json.into()))
        .map_err(|e| TunnelError::WebSocketError(e.to_string()))
}

/// Headers for the call to the local server
fn local_request_headers(request: &RequestFrame) -> HashMap<String, String> {
    let mut headers = request.headers.clone();
    strip_request_headers(&mut headers);

    // Bodies are relayed as-is; never ask the local server to compress them
    headers.insert("accept-encoding".to_string(), "identity".to_string());

    if request.body.as_ref().is_some_and(Body::is_json) && request.header("content-type").is_none() {
        headers.insert("content-type".to_string(), "application/json".to_string());
    }
    headers
}

/// Execute one relayed request against the local server
///
/// Always produces a reply: the response, or an `error` frame for the same
/// request ID.
async fn forward_to_local(local: &LocalService, request: RequestFrame) -> Message {
    let start_time = Instant::now();
    let request_id = request.request_id.clone();

    let fail = |code: ErrorCode, message: String| {
        warn!("Request {} failed: {}", request_id, message);
        Message::error(Some(request_id.clone()), code, message)
    };

    let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
        return fail(
            ErrorCode::InvalidRequest,
            format!("Unsupported HTTP method: {}", request.method),
        );
    };

    let body = match request.body.as_ref().map(Body::to_bytes).transpose() {
        Ok(body) => body,
        Err(e) => return fail(ErrorCode::InvalidRequest, format!("Failed to decode body: {}", e)),
    };

    let url = format!("{}{}", local.address, request.path);
    debug!("Forwarding: {} {}", method, url);

    let mut builder = local
        .client
        .request(method, &url)
        .headers(map_to_headers(&local_request_headers(&request)));
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return fail(ErrorCode::Timeout, e.to_string()),
        Err(e) => return fail(ErrorCode::LocalServiceUnavailable, e.to_string()),
    };

    let status_code = response.status().as_u16();
    let mut headers = headers_to_map(response.headers());
    strip_response_headers(&mut headers);

    let body_bytes = match read_limited(response, local.max_body_size).await {
        Ok(bytes) => bytes,
        Err((code, message)) => return fail(code, message),
    };

    let processing_time_ms = start_time.elapsed().as_millis() as u64;
    debug!("Response: {} ({}ms)", status_code, processing_time_ms);

    Message::HttpResponse(ResponseFrame {
        request_id,
        status_code,
        headers,
        body: (!body_bytes.is_empty()).then(|| Body::from_bytes(&body_bytes)),
        processing_time_ms,
    })
}

/// Read a local response body, giving up as soon as it exceeds `limit`
async fn read_limited(mut response: Response, limit: usize) -> Result<Vec<u8>, (ErrorCode, String)> {
    let too_large = || {
        (
            ErrorCode::PayloadTooLarge,
            format!("Response body exceeds the {}-byte limit", limit),
        )
    };

    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > limit {
                    return Err(too_large());
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(body),
            Err(e) => return Err((ErrorCode::LocalServiceUnavailable, e.to_string())),
        }
    }
}

/// Heartbeat task sends periodic ping messages
async fn spawn_heartbeat_task(outgoing_tx: mpsc::Sender<WsMessage>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if let Err(e) = send_message(&outgoing_tx, &Message::Ping).await {
            error!("Failed to send heartbeat: {}", e);
            break;
        }

        debug!("Sent heartbeat");
    }

    debug!("Heartbeat task exiting");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("tunnelhub v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(args)?;
    info!("Local service: {}", config.local_address);
    info!("Broker: {}", config.websocket_url);

    let manager = ConnectionManager::new(config)?;

    // Run until interrupted
    tokio::select! {
        result = manager.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn args() -> Args {
        Args {
            port: 8080,
            host: "localhost".to_string(),
            server: "ws://broker.example.com/ws".to_string(),
            id: Some("my-app".to_string()),
            password: None,
            verbose: false,
            connect_timeout: 10,
            request_timeout: 25,
            max_payload_mb: 50,
        }
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(args()).unwrap();
        assert_eq!(config.local_address, "http://localhost:8080");
        assert_eq!(config.websocket_url, "ws://broker.example.com/ws");
        assert_eq!(config.tunnel_id, "my-app");
        assert_eq!(config.password, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(25));
        assert_eq!(
            config.heartbeat_interval,
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_config_generates_tunnel_id() {
        let config = Config::from_args(Args {
            id: None,
            password: Some(String::new()),
            ..args()
        })
        .unwrap();

        assert!(config.tunnel_id.starts_with("th-"));
        assert!(validate_tunnel_id(&config.tunnel_id).is_ok());
        assert_eq!(config.password, None);
    }

    #[test]
    fn test_config_rejects_invalid_tunnel_id() {
        let result = Config::from_args(Args {
            id: Some("not valid!".to_string()),
            ..args()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("https://tunnels.example.com").unwrap(),
            "wss://tunnels.example.com/ws"
        );
        assert_eq!(
            websocket_url("http://localhost:3000/").unwrap(),
            "ws://localhost:3000/ws"
        );
        assert_eq!(
            websocket_url("wss://tunnels.example.com/custom").unwrap(),
            "wss://tunnels.example.com/custom"
        );
        assert!(websocket_url("ftp://example.com").is_err());
        assert!(websocket_url("not a url").is_err());
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = Config::from_args(args()).unwrap();
        let reconnect = &config.reconnect_config;

        assert_eq!(reconnect.min_delay, Duration::from_millis(RECONNECT_MIN_DELAY_MS));
        assert_eq!(reconnect.max_attempts, None);
        assert_eq!(
            reconnect.next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            reconnect.next_delay(Duration::from_secs(40)),
            Duration::from_millis(RECONNECT_MAX_DELAY_MS)
        );
    }

    #[test]
    fn test_local_request_headers() {
        let mut request = RequestFrame::new("req-1".into(), "POST".into(), "/".into(), 0);
        request.headers.insert("host".into(), "public.example.com".into());
        request.headers.insert("accept-encoding".into(), "gzip, br".into());
        request.headers.insert("x-custom".into(), "1".into());
        request.body = Some(Body::Json(serde_json::json!({"a": 1})));

        let headers = local_request_headers(&request);
        assert!(!headers.contains_key("host"));
        assert_eq!(headers.get("accept-encoding").unwrap(), "identity");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-custom").unwrap(), "1");

        request
            .headers
            .insert("content-type".into(), "application/vnd.api+json".into());
        let headers = local_request_headers(&request);
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/vnd.api+json"
        );
    }

    fn local(address: String, max_body_size: usize) -> LocalService {
        LocalService {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            address,
            max_body_size,
        }
    }

    /// Serve one canned HTTP response on a fresh loopback port
    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn get_request() -> RequestFrame {
        RequestFrame::new("req-1".into(), "GET".into(), "/".into(), 0)
    }

    fn expect_error(reply: Message) -> ErrorCode {
        match reply {
            Message::Error {
                request_id, code, ..
            } => {
                assert_eq!(request_id.as_deref(), Some("req-1"));
                code
            }
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn test_websocket_config_fits_largest_body() {
        let config = websocket_config(MAX_BODY_SIZE_BYTES);
        let limit = max_ws_message_size(MAX_BODY_SIZE_BYTES);

        assert_eq!(config.max_message_size, Some(limit));
        assert_eq!(config.max_frame_size, Some(limit));
        // A full body, base64-encoded, must fit in one message and one frame
        assert!(limit > MAX_BODY_SIZE_BYTES / 3 * 4);
        assert!(limit > 16 << 20);
    }

    #[tokio::test]
    async fn test_local_response_is_relayed() {
        let address = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Custom: yes\r\nConnection: close\r\n\r\nhello"
                .to_vec(),
        )
        .await;

        match forward_to_local(&local(address, 1024), get_request()).await {
            Message::HttpResponse(response) => {
                assert_eq!(response.request_id, "req-1");
                assert_eq!(response.status_code, 200);
                assert_eq!(response.headers.get("x-custom").unwrap(), "yes");
                assert!(!response.headers.contains_key("content-length"));
                assert_eq!(response.body.unwrap().to_bytes().unwrap(), b"hello");
            }
            other => panic!("expected http_response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_declared_response_is_rejected() {
        let address = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n".to_vec(),
        )
        .await;

        let code = expect_error(forward_to_local(&local(address, 1024), get_request()).await);
        assert_eq!(code, ErrorCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_oversized_streamed_response_is_rejected() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
        for _ in 0..4 {
            response.extend_from_slice(b"200\r\n");
            response.extend_from_slice(&[b'x'; 512]);
            response.extend_from_slice(b"\r\n");
        }
        response.extend_from_slice(b"0\r\n\r\n");
        let address = serve_once(response).await;

        let code = expect_error(forward_to_local(&local(address, 1024), get_request()).await);
        assert_eq!(code, ErrorCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_unreachable_local_server_answers_with_error_frame() {
        // Bind and release a port so nothing listens on it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let code = expect_error(forward_to_local(&local(address, 1024), get_request()).await);
        assert!(matches!(
            code,
            ErrorCode::LocalServiceUnavailable | ErrorCode::Timeout
        ));
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let request = RequestFrame::new("req-1".into(), "BAD METHOD".into(), "/".into(), 0);
        let service = local("http://127.0.0.1:9".to_string(), 1024);

        let code = expect_error(forward_to_local(&service, request).await);
        assert_eq!(code, ErrorCode::InvalidRequest);
    }
}
