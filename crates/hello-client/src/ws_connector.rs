//! WebSocket [`Connector`]: one socket per session, kept alive with pings.

use std::sync::Arc;
use std::time::Duration;

use cs_client_sdk::{Connector, ConnectorError, DeviceIdentity};
use cs_domain::config::ConnectorConfig;
use cs_domain::identity::mask_secret;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Session {
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
}

pub struct WsConnector {
    url: String,
    /// Same URL with the key masked, for logs.
    log_url: String,
    open_timeout: Duration,
    keepalive: Duration,
    session: Mutex<Option<Session>>,
    lost: Arc<Notify>,
}

impl WsConnector {
    pub fn new(cfg: &ConnectorConfig, identity: &dyn DeviceIdentity) -> Self {
        Self {
            url: build_url(&cfg.url, identity.dev_key(), identity.dev_sn()),
            log_url: build_url(&cfg.url, &mask_secret(identity.dev_key()), identity.dev_sn()),
            open_timeout: Duration::from_secs(cfg.open_timeout_secs),
            keepalive: Duration::from_secs(cfg.keepalive_secs.max(1)),
            session: Mutex::new(None),
            lost: Arc::new(Notify::new()),
        }
    }

    /// Notified when the server ends a session the client did not close.
    pub fn session_lost(&self) -> Arc<Notify> {
        self.lost.clone()
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<(), ConnectorError> {
        // A leftover session would hold a second socket for the same device.
        if let Some(stale) = self.session.lock().take() {
            stale.shutdown.cancel();
        }

        tracing::info!(url = %self.log_url, "connecting");
        let ws = match tokio::time::timeout(
            self.open_timeout,
            tokio_tungstenite::connect_async(&self.url),
        )
        .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(map_ws_error(e)),
            Err(_) => {
                return Err(ConnectorError::Timeout(format!(
                    "no handshake within {}s",
                    self.open_timeout.as_secs()
                )))
            }
        };
        tracing::info!("session open");

        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive(
            ws,
            self.keepalive,
            shutdown.clone(),
            self.lost.clone(),
        ));
        *self.session.lock() = Some(Session { shutdown, driver });
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.shutdown.cancel();
        match tokio::time::timeout(CLOSE_TIMEOUT, session.driver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectorError::Failed(format!("session task: {e}"))),
            Err(_) => Err(ConnectorError::Timeout("close handshake".into())),
        }
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// Append the device credentials as query parameters.
fn build_url(base: &str, dev_key: &str, dev_sn: &str) -> String {
    format!(
        "{}{}dev_key={}&dev_sn={}",
        base,
        if base.contains('?') { "&" } else { "?" },
        dev_key,
        dev_sn,
    )
}

fn map_ws_error(e: tungstenite::Error) -> ConnectorError {
    match e {
        tungstenite::Error::Io(io) => ConnectorError::Unreachable(io.to_string()),
        tungstenite::Error::Http(resp) => {
            ConnectorError::Rejected(format!("HTTP {}", resp.status()))
        }
        other => ConnectorError::Failed(other.to_string()),
    }
}

/// Own the socket until shutdown or until the server goes away.
async fn drive(ws: WsStream, keepalive: Duration, shutdown: CancellationToken, lost: Arc<Notify>) {
    let (mut sink, mut stream) = ws.split();
    let mut ticker = tokio::time::interval(keepalive);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "close frame not sent");
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    tracing::warn!(error = %e, "keepalive ping failed");
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(len = text.len(), "inbound text frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "server closed the session");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "session read error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if !shutdown.is_cancelled() {
        lost.notify_one();
    }
}
