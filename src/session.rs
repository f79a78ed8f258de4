use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::guacd::{GuacdClient, GuacdError, GuacdReader, GuacdWriter};
use crate::models::{AppState, ConnectionRequest};

/// Application-level WebSocket close codes, the browser's only stable error
/// signal.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL: u16 = 1011;
    pub const MISSING_TOKEN: u16 = 4001;
    pub const BAD_FRAME: u16 = 4400;
    pub const INVALID_TOKEN: u16 = 4401;
    pub const REFUSED: u16 = 4403;
    pub const INACTIVITY: u16 = 4408;
    pub const HANDSHAKE_TIMEOUT: u16 = 4504;
}

/// An encoded `disconnect;` at the start of a client frame ends the session
/// once the frame has been forwarded.
const CLIENT_DISCONNECT: &str = "10.disconnect;";

/// How a relay ended when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    BrowserClosed,
    UpstreamClosed,
    Disconnected,
}

/// Failures inside the relay phase. Earlier phases (auth, hook, handshake)
/// close the socket directly with their own codes.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("inactivity timeout")]
    InactivityTimeout,
    #[error("unsupported frame type")]
    BadFrame,
    #[error(transparent)]
    Upstream(#[from] GuacdError),
}

impl SessionError {
    fn close_code(&self) -> u16 {
        match self {
            SessionError::InactivityTimeout => close_code::INACTIVITY,
            SessionError::BadFrame => close_code::BAD_FRAME,
            SessionError::Upstream(_) => close_code::INTERNAL,
        }
    }
}

/// One browser connection, from accepted upgrade to teardown.
///
/// The lifecycle is authenticate → hook → dial-and-handshake → relay. Every
/// exit path closes the WebSocket with the mapped close code; dropping the
/// session closes both sockets.
pub struct ClientSession {
    id: Uuid,
    state: AppState,
    request: ConnectionRequest,
}

impl ClientSession {
    pub fn new(state: AppState, request: ConnectionRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            state,
            request,
        }
    }

    pub async fn run(self, mut socket: WebSocket) {
        debug!(
            session = %self.id,
            origin = ?self.request.headers.get("origin"),
            "upgrade accepted"
        );

        let Some(token) = self.request.query.get("token") else {
            info!(session = %self.id, "rejecting upgrade without a token");
            close(&mut socket, close_code::MISSING_TOKEN, "missing token").await;
            return;
        };

        let settings = match self.state.cipher.decrypt(token) {
            Ok(settings) => settings,
            Err(err) => {
                info!(session = %self.id, %err, "token rejected");
                close(&mut socket, close_code::INVALID_TOKEN, &err.to_string()).await;
                return;
            }
        };

        let settings = match self.state.hook.decide(settings, &self.request) {
            Ok(settings) => settings,
            Err(refusal) => {
                info!(session = %self.id, reason = %refusal.reason, "hook refused connection");
                close(&mut socket, close_code::REFUSED, "connection refused").await;
                return;
            }
        };

        info!(
            session = %self.id,
            protocol = settings.connection.kind.as_str(),
            "opening guacd session"
        );

        let handshake = timeout(self.state.guacd.connection_timeout, async {
            let mut client = GuacdClient::connect(&self.state.guacd).await?;
            let ready = client.handshake(&settings.connection).await?;
            Ok::<_, GuacdError>((client, ready))
        })
        .await;

        let (client, ready) = match handshake {
            Err(_) => {
                warn!(session = %self.id, "guacd handshake timed out");
                close(&mut socket, close_code::HANDSHAKE_TIMEOUT, "handshake timeout").await;
                return;
            }
            Ok(Err(err)) => {
                warn!(session = %self.id, %err, "guacd handshake failed");
                close(&mut socket, close_code::INTERNAL, &err.to_string()).await;
                return;
            }
            Ok(Ok(established)) => established,
        };

        // The browser learns its connection id from the forwarded `ready`.
        if socket
            .send(Message::Text(ready.encode().into()))
            .await
            .is_err()
        {
            return;
        }

        info!(
            session = %self.id,
            connection_id = client.connection_id().unwrap_or(""),
            "relay established"
        );

        let (reader, writer) = client.into_split();
        match relay(socket, reader, writer, self.state.client.max_inactivity).await {
            Ok(end) => info!(session = %self.id, ?end, "session closed"),
            Err(err) => warn!(session = %self.id, %err, "session failed"),
        }
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from(reason.to_owned()),
        })))
        .await;
}

/// Run both pumps until either finishes, then close the browser side with
/// the mapped code. The `select!` is the teardown mechanism: whichever pump
/// returns first drops the other mid-await, which cancels its pending I/O.
async fn relay<R, W>(
    socket: WebSocket,
    mut reader: GuacdReader<R>,
    mut writer: GuacdWriter<W>,
    max_inactivity: Duration,
) -> Result<SessionEnd, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = socket.split();

    let outcome = {
        let downstream = downstream_pump(&mut reader, &mut ws_tx);
        let upstream = upstream_pump(&mut ws_rx, &mut writer, max_inactivity);
        tokio::pin!(downstream, upstream);
        tokio::select! {
            result = &mut downstream => result,
            result = &mut upstream => result,
        }
    };

    let frame = match &outcome {
        Ok(_) => CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        },
        Err(err) => CloseFrame {
            code: err.close_code(),
            reason: Utf8Bytes::from(err.to_string()),
        },
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    outcome
}

/// guacd → browser: one decoded instruction per text frame, no coalescing.
async fn downstream_pump<R: AsyncRead + Unpin>(
    reader: &mut GuacdReader<R>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<SessionEnd, SessionError> {
    loop {
        let Some(instruction) = reader.read_instruction().await? else {
            return Ok(SessionEnd::UpstreamClosed);
        };
        // In-band `error` instructions pass through like any other traffic.
        let disconnect = instruction.opcode() == "disconnect";
        if ws_tx
            .send(Message::Text(instruction.encode().into()))
            .await
            .is_err()
        {
            return Ok(SessionEnd::BrowserClosed);
        }
        if disconnect {
            return Ok(SessionEnd::Disconnected);
        }
    }
}

/// browser → guacd: text frames forwarded byte-for-byte. A frame may carry
/// several concatenated instructions; guacd does its own framing.
async fn upstream_pump<W: AsyncWrite + Unpin>(
    ws_rx: &mut SplitStream<WebSocket>,
    writer: &mut GuacdWriter<W>,
    max_inactivity: Duration,
) -> Result<SessionEnd, SessionError> {
    loop {
        let message = match timeout(max_inactivity, ws_rx.next()).await {
            Err(_) => return Err(SessionError::InactivityTimeout),
            Ok(None) => return Ok(SessionEnd::BrowserClosed),
            Ok(Some(Err(_))) => return Ok(SessionEnd::BrowserClosed),
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Text(text) => {
                writer.write_raw(text.as_str()).await?;
                if text.as_str().starts_with(CLIENT_DISCONNECT) {
                    return Ok(SessionEnd::Disconnected);
                }
            }
            Message::Binary(_) => return Err(SessionError::BadFrame),
            Message::Close(_) => return Ok(SessionEnd::BrowserClosed),
            // The transport answers pings on its own; both still count as
            // upstream liveness for the inactivity timer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
