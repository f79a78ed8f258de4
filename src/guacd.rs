use std::collections::VecDeque;
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::models::{ConnectionDescriptor, GuacdOptions};
use crate::protocol::{Instruction, InstructionDecoder, ProtocolError};

const DEFAULT_WIDTH: u32 = 1024;
const DEFAULT_HEIGHT: u32 = 768;
const DEFAULT_DPI: u32 = 96;

const READ_CHUNK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum GuacdError {
    #[error("guacd is unreachable")]
    UpstreamUnavailable(#[source] std::io::Error),
    #[error("guacd rejected the connection: {message} (code {code})")]
    UpstreamRejected { code: String, message: String },
    #[error("guacd i/o failed")]
    UpstreamIO(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected `{opcode}` from guacd while {state}")]
    UnexpectedOpcode {
        state: HandshakeState,
        opcode: String,
    },
    #[error("guacd closed the connection during the handshake")]
    ClosedDuringHandshake,
}

/// Where the upstream connection is in its lifecycle. The handshake walks
/// `Connecting → AwaitingArgs → Negotiating → AwaitingReady → Ready`;
/// `Failed` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingArgs,
    Negotiating,
    AwaitingReady,
    Ready,
    Closed,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Connecting => "connecting",
            HandshakeState::AwaitingArgs => "awaiting_args",
            HandshakeState::Negotiating => "negotiating",
            HandshakeState::AwaitingReady => "awaiting_ready",
            HandshakeState::Ready => "ready",
            HandshakeState::Closed => "closed",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Client side of the guacd wire protocol: dials the daemon, drives the
/// configuration handshake, then splits into relay halves.
///
/// Generic over the transport so the handshake can be exercised against
/// in-memory streams; production use is `TcpStream`.
pub struct GuacdClient<S> {
    stream: S,
    decoder: InstructionDecoder,
    queue: VecDeque<Instruction>,
    state: HandshakeState,
    connection_id: Option<String>,
}

impl GuacdClient<TcpStream> {
    pub async fn connect(options: &GuacdOptions) -> Result<Self, GuacdError> {
        let address = options.address();
        debug!(%address, "dialing guacd");
        let stream = TcpStream::connect(&address)
            .await
            .map_err(GuacdError::UpstreamUnavailable)?;
        Ok(Self::from_stream(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> GuacdClient<S> {
    /// Wrap an already-established connection; the TCP dial is the only
    /// part this skips. Nothing has been sent yet, so the handshake is
    /// still in `Connecting`.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            decoder: InstructionDecoder::new(),
            queue: VecDeque::new(),
            state: HandshakeState::Connecting,
            connection_id: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The upstream-assigned connection identifier, available once `Ready`.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Drive the `select → args → configuration → connect → ready` exchange.
    ///
    /// Returns the `ready` instruction so the caller can forward it to the
    /// browser, which learns its connection id from it.
    pub async fn handshake(
        &mut self,
        connection: &ConnectionDescriptor,
    ) -> Result<Instruction, GuacdError> {
        // Joining an existing session selects its id instead of a protocol.
        let select_target = connection
            .join
            .as_deref()
            .unwrap_or_else(|| connection.kind.as_str());
        self.send(&Instruction::new("select", [select_target]))
            .await?;
        self.state = HandshakeState::AwaitingArgs;

        let args = self.expect_instruction().await?;
        match args.opcode() {
            "args" => {}
            "error" => return Err(self.rejected(&args)),
            other => return Err(self.unexpected(other)),
        }
        self.state = HandshakeState::Negotiating;

        // The first `args` element is the protocol/version tag; the
        // parameter names follow it.
        let parameter_names = args.args().get(1..).unwrap_or_default();
        debug!(parameters = parameter_names.len(), "received args from guacd");

        for instruction in negotiation_instructions(connection) {
            self.send(&instruction).await?;
        }

        // `connect` values mirror the declared parameter order exactly;
        // names the token does not cover are sent as empty strings.
        let values = parameter_names
            .iter()
            .map(|name| connection.settings.get(name).cloned().unwrap_or_default());
        self.send(&Instruction::new("connect", values)).await?;
        self.state = HandshakeState::AwaitingReady;

        let ready = self.expect_instruction().await?;
        match ready.opcode() {
            "ready" => {
                self.connection_id = ready.arg(0).map(str::to_string);
                self.state = HandshakeState::Ready;
                debug!(connection_id = ?self.connection_id, "guacd session ready");
                Ok(ready)
            }
            "error" => Err(self.rejected(&ready)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Split into independently owned relay halves. Only meaningful once
    /// the handshake has completed.
    pub fn into_split(self) -> (GuacdReader<ReadHalf<S>>, GuacdWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            GuacdReader {
                read,
                decoder: self.decoder,
                queue: self.queue,
                state: self.state,
            },
            GuacdWriter { write },
        )
    }

    fn rejected(&mut self, error: &Instruction) -> GuacdError {
        self.state = HandshakeState::Failed;
        GuacdError::UpstreamRejected {
            message: error.arg(0).unwrap_or_default().to_string(),
            code: error.arg(1).unwrap_or_default().to_string(),
        }
    }

    fn unexpected(&mut self, opcode: &str) -> GuacdError {
        let state = self.state;
        self.state = HandshakeState::Failed;
        GuacdError::UnexpectedOpcode {
            state,
            opcode: opcode.to_string(),
        }
    }

    async fn send(&mut self, instruction: &Instruction) -> Result<(), GuacdError> {
        let encoded = instruction.encode();
        trace!(%encoded, "-> guacd");
        self.stream.write_all(encoded.as_bytes()).await?;
        Ok(())
    }

    async fn expect_instruction(&mut self) -> Result<Instruction, GuacdError> {
        loop {
            if let Some(instruction) = self.queue.pop_front() {
                return Ok(instruction);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                self.state = HandshakeState::Failed;
                return Err(GuacdError::ClosedDuringHandshake);
            }
            self.queue.extend(self.decoder.feed(&chunk[..n])?);
        }
    }
}

/// The `size`/`audio`/`video`/`image`/`timezone` instructions announced
/// before `connect`. `size` always goes out (falling back to the protocol
/// defaults); the rest only when the token asked for them.
fn negotiation_instructions(connection: &ConnectionDescriptor) -> Vec<Instruction> {
    let overrides = &connection.guac;
    let setting_u32 = |name: &str| {
        connection
            .settings
            .get(name)
            .and_then(|value| value.parse::<u32>().ok())
    };

    let width = overrides.width.or_else(|| setting_u32("width")).unwrap_or(DEFAULT_WIDTH);
    let height = overrides
        .height
        .or_else(|| setting_u32("height"))
        .unwrap_or(DEFAULT_HEIGHT);
    let dpi = overrides.dpi.or_else(|| setting_u32("dpi")).unwrap_or(DEFAULT_DPI);

    let mut instructions = vec![Instruction::new(
        "size",
        [width.to_string(), height.to_string(), dpi.to_string()],
    )];
    if !overrides.audio.is_empty() {
        instructions.push(Instruction::new("audio", overrides.audio.clone()));
    }
    if !overrides.video.is_empty() {
        instructions.push(Instruction::new("video", overrides.video.clone()));
    }
    if !overrides.image.is_empty() {
        instructions.push(Instruction::new("image", overrides.image.clone()));
    }
    if let Some(timezone) = &overrides.timezone {
        instructions.push(Instruction::new("timezone", [timezone.clone()]));
    }
    instructions
}

/// Read half of a ready guacd link. Single consumer by contract; carries
/// the link state forward from the handshake.
pub struct GuacdReader<R> {
    read: R,
    decoder: InstructionDecoder,
    queue: VecDeque<Instruction>,
    state: HandshakeState,
}

impl<R: AsyncRead + Unpin> GuacdReader<R> {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Next decoded instruction, or `None` once guacd closes the link.
    pub async fn read_instruction(&mut self) -> Result<Option<Instruction>, GuacdError> {
        loop {
            if let Some(instruction) = self.queue.pop_front() {
                return Ok(Some(instruction));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = match self.read.read(&mut chunk).await {
                Ok(n) => n,
                Err(err) => {
                    self.state = HandshakeState::Failed;
                    return Err(err.into());
                }
            };
            if n == 0 {
                self.state = HandshakeState::Closed;
                return Ok(None);
            }
            match self.decoder.feed(&chunk[..n]) {
                Ok(instructions) => self.queue.extend(instructions),
                Err(err) => {
                    self.state = HandshakeState::Failed;
                    return Err(err.into());
                }
            }
        }
    }
}

/// Write half of a ready guacd link. Single producer by contract.
pub struct GuacdWriter<W> {
    write: W,
}

impl<W: AsyncWrite + Unpin> GuacdWriter<W> {
    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<(), GuacdError> {
        self.write_raw(&instruction.encode()).await
    }

    /// Forward already-encoded instruction text without re-framing.
    pub async fn write_raw(&mut self, encoded: &str) -> Result<(), GuacdError> {
        trace!(%encoded, "-> guacd");
        self.write.write_all(encoded.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::models::{ConnectionSettings, HandshakeOverrides, ProtocolKind};

    /// Scripted guacd peer for one end of a duplex pipe.
    struct MockGuacd {
        stream: DuplexStream,
        decoder: InstructionDecoder,
        queue: VecDeque<Instruction>,
    }

    impl MockGuacd {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                decoder: InstructionDecoder::new(),
                queue: VecDeque::new(),
            }
        }

        async fn read_instruction(&mut self) -> Instruction {
            loop {
                if let Some(instruction) = self.queue.pop_front() {
                    return instruction;
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before the mock finished");
                self.queue.extend(self.decoder.feed(&chunk[..n]).unwrap());
            }
        }

        async fn write(&mut self, encoded: &str) {
            self.stream.write_all(encoded.as_bytes()).await.unwrap();
        }
    }

    fn rdp_settings() -> ConnectionSettings {
        let mut settings = HashMap::new();
        settings.insert("hostname".to_string(), "h".to_string());
        settings.insert("port".to_string(), "3389".to_string());
        settings.insert("ignored".to_string(), "never-sent".to_string());
        ConnectionSettings::new(ProtocolKind::Rdp, settings)
    }

    #[tokio::test]
    async fn handshake_maps_connect_values_positionally() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);
        let mut mock = MockGuacd::new(far);

        let driver = tokio::spawn(async move {
            assert_eq!(
                mock.read_instruction().await,
                Instruction::new("select", ["rdp"])
            );
            mock.write("4.args,13.VERSION_1_1_0,8.hostname,4.port,8.username;")
                .await;

            let size = mock.read_instruction().await;
            assert_eq!(size, Instruction::new("size", ["1024", "768", "96"]));

            let connect = mock.read_instruction().await;
            assert_eq!(connect.opcode(), "connect");
            assert_eq!(connect.args(), ["h", "3389", ""]);

            mock.write("5.ready,4.$abc;").await;
            mock
        });

        let settings = rdp_settings();
        let ready = client.handshake(&settings.connection).await.unwrap();
        assert_eq!(ready, Instruction::new("ready", ["$abc"]));
        assert_eq!(client.state(), HandshakeState::Ready);
        assert_eq!(client.connection_id(), Some("$abc"));

        driver.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_announces_overrides() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);
        let mut mock = MockGuacd::new(far);

        let driver = tokio::spawn(async move {
            mock.read_instruction().await; // select
            mock.write("4.args,3.vnc,8.hostname;").await;

            assert_eq!(
                mock.read_instruction().await,
                Instruction::new("size", ["1920", "1080", "96"])
            );
            assert_eq!(
                mock.read_instruction().await,
                Instruction::new("audio", ["audio/L16", "audio/L8"])
            );
            assert_eq!(
                mock.read_instruction().await,
                Instruction::new("timezone", ["Europe/Berlin"])
            );
            assert_eq!(mock.read_instruction().await.opcode(), "connect");

            mock.write("5.ready,4.$xyz;").await;
        });

        let mut settings = ConnectionSettings::new(ProtocolKind::Vnc, HashMap::new());
        settings.connection.guac = HandshakeOverrides {
            width: Some(1920),
            height: Some(1080),
            audio: vec!["audio/L16".into(), "audio/L8".into()],
            timezone: Some("Europe/Berlin".into()),
            ..HandshakeOverrides::default()
        };
        client.handshake(&settings.connection).await.unwrap();

        driver.await.unwrap();
    }

    #[tokio::test]
    async fn joining_selects_the_existing_session() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);
        let mut mock = MockGuacd::new(far);

        let driver = tokio::spawn(async move {
            assert_eq!(
                mock.read_instruction().await,
                Instruction::new("select", ["$existing"])
            );
            mock.write("4.args,3.rdp;").await;
            mock.read_instruction().await; // size
            mock.read_instruction().await; // connect
            mock.write("5.ready,4.$new;").await;
        });

        let mut settings = rdp_settings();
        settings.connection.join = Some("$existing".into());
        client.handshake(&settings.connection).await.unwrap();

        driver.await.unwrap();
    }

    #[tokio::test]
    async fn rejection_carries_message_and_code() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);
        let mut mock = MockGuacd::new(far);

        tokio::spawn(async move {
            mock.read_instruction().await;
            mock.write("5.error,9.bad-proto,3.256;").await;
        });

        let settings = rdp_settings();
        let err = client.handshake(&settings.connection).await.unwrap_err();
        match err {
            GuacdError::UpstreamRejected { code, message } => {
                assert_eq!(message, "bad-proto");
                assert_eq!(code, "256");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn unexpected_opcode_fails_the_handshake() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);
        let mut mock = MockGuacd::new(far);

        tokio::spawn(async move {
            mock.read_instruction().await;
            mock.write("4.sync,1.0;").await;
        });

        let settings = rdp_settings();
        let err = client.handshake(&settings.connection).await.unwrap_err();
        assert!(matches!(err, GuacdError::UnexpectedOpcode { .. }));
    }

    #[tokio::test]
    async fn eof_during_handshake_fails() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = GuacdClient::from_stream(near);

        tokio::spawn(async move {
            let mut mock = MockGuacd::new(far);
            mock.read_instruction().await;
            // Dropping the stream closes the pipe without replying.
        });

        let settings = rdp_settings();
        let err = client.handshake(&settings.connection).await.unwrap_err();
        assert!(matches!(err, GuacdError::ClosedDuringHandshake));
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn split_halves_relay_instructions() {
        let (near, far) = tokio::io::duplex(4096);
        let client = GuacdClient::from_stream(near);
        let (mut reader, mut writer) = client.into_split();
        let mut mock = MockGuacd::new(far);

        writer
            .write_instruction(&Instruction::new("key", ["100", "1"]))
            .await
            .unwrap();
        assert_eq!(
            mock.read_instruction().await,
            Instruction::new("key", ["100", "1"])
        );

        mock.write("4.sync,2.42;").await;
        assert_eq!(
            reader.read_instruction().await.unwrap(),
            Some(Instruction::new("sync", ["42"]))
        );

        drop(mock);
        assert!(reader.read_instruction().await.unwrap().is_none());
        assert_eq!(reader.state(), HandshakeState::Closed);
    }
}
