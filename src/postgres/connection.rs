//! A replication-mode connection speaking the frontend/backend protocol
//! directly.
//!
//! `tokio-postgres` cannot enter copy-both mode, so the replication stream
//! runs over a plain socket using the `postgres-protocol` message codecs.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{ErrorFields, Message};
use postgres_protocol::message::frontend;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{CopyRead, QueryRow, ReplicationTransport};
use crate::config::PostgresConfig;
use crate::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Tag of `CopyBothResponse`, which `Message::parse` does not recognise.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// SQLSTATE class 28: invalid authorization specification.
const INVALID_AUTHORIZATION_CLASS: &str = "28";

pub struct PgConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    process_id: Option<i32>,
    in_copy: bool,
    closed: bool,
}

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Default)]
struct ServerMessage {
    severity: String,
    code: String,
    message: String,
}

impl ServerMessage {
    fn parse(mut fields: ErrorFields<'_>) -> Self {
        let mut parsed = ServerMessage::default();
        while let Ok(Some(field)) = fields.next() {
            let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
            match field.type_() {
                // The non-localized severity wins over the localized one.
                b'V' => parsed.severity = value,
                b'S' if parsed.severity.is_empty() => parsed.severity = value,
                b'C' => parsed.code = value,
                b'M' => parsed.message = value,
                _ => {}
            }
        }
        parsed
    }

    fn into_error(self) -> Error {
        Error::Server {
            severity: self.severity,
            code: self.code,
            message: self.message,
        }
    }

    /// Errors during authentication are credential failures only when the
    /// server says so. Anything else (a server still starting up, too many
    /// clients) stays a server error so that FATAL ones can be retried.
    fn into_startup_error(self) -> Error {
        if self.code.starts_with(INVALID_AUTHORIZATION_CLASS) {
            Error::Authentication(format!("{} ({})", self.message, self.code))
        } else {
            self.into_error()
        }
    }
}

/// A backend message, plus the one `postgres-protocol` cannot parse.
enum BackendMessage {
    CopyBothResponse,
    Other(Message),
}

impl BackendMessage {
    /// Splits one complete message off the front of `buf`, or returns `None`
    /// if more bytes are needed.
    fn parse(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.first() != Some(&COPY_BOTH_RESPONSE_TAG) {
            return Ok(Message::parse(buf)?.map(BackendMessage::Other));
        }
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len >= 4)
            .ok_or_else(|| Error::Protocol(format!("invalid CopyBothResponse length {}", len)))?;
        if buf.len() < len + 1 {
            return Ok(None);
        }
        // The body only lists column formats, which copy-both replication
        // does not use.
        buf.advance(len + 1);
        Ok(Some(BackendMessage::CopyBothResponse))
    }
}

impl PgConnection {
    /// Connects and authenticates with `replication=database`.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        tokio::time::timeout(timeout, Self::establish(config))
            .await
            .map_err(|_| Error::Timeout {
                message: format!(
                    "connecting to {}:{} took longer than {:?}",
                    config.host, config.port, timeout
                ),
            })?
    }

    async fn establish(config: &PostgresConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(1024),
            process_id: None,
            in_copy: false,
            closed: false,
        };

        let params = [
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", env!("CARGO_PKG_NAME")),
            ("client_encoding", "UTF8"),
        ];
        frontend::startup_message(params.iter().copied(), &mut conn.write_buf)?;
        conn.flush().await?;

        conn.authenticate(&config.username, config.password.as_deref())
            .await?;
        conn.wait_for_ready().await?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            backend_pid = ?conn.process_id,
            "Connected in replication mode"
        );
        Ok(conn)
    }

    pub fn process_id(&self) -> Option<i32> {
        self.process_id
    }

    async fn authenticate(&mut self, user: &str, password: Option<&str>) -> Result<()> {
        let password = || {
            password.ok_or_else(|| {
                Error::Authentication("server requested a password but none is configured".into())
            })
        };

        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => return Ok(()),
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password()?.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hash = authentication::md5_hash(
                        user.as_bytes(),
                        password()?.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut has_scram = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            has_scram = true;
                        }
                    }
                    if !has_scram {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".into(),
                        ));
                    }
                    self.authenticate_scram(password()?).await?;
                }
                Message::ErrorResponse(body) => {
                    return Err(ServerMessage::parse(body.fields()).into_startup_error())
                }
                _ => {
                    return Err(Error::Authentication(
                        "unsupported authentication request".into(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &str) -> Result<()> {
        let mut scram =
            sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslContinue(body) => scram
                .update(body.data())
                .map_err(|e| Error::Authentication(e.to_string()))?,
            Message::ErrorResponse(body) => {
                return Err(ServerMessage::parse(body.fields()).into_startup_error())
            }
            _ => return Err(Error::Protocol("expected SASL continue".into())),
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslFinal(body) => scram
                .finish(body.data())
                .map_err(|e| Error::Authentication(e.to_string())),
            Message::ErrorResponse(body) => {
                Err(ServerMessage::parse(body.fields()).into_startup_error())
            }
            _ => Err(Error::Protocol("expected SASL final".into())),
        }
    }

    /// Consumes startup chatter until the server is ready for queries.
    async fn wait_for_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::BackendKeyData(body) => self.process_id = Some(body.process_id()),
                Message::ParameterStatus(body) => {
                    debug!(name = %body.name()?, value = %body.value()?, "Server parameter");
                }
                Message::NoticeResponse(body) => log_notice(body.fields()),
                Message::ErrorResponse(body) => {
                    return Err(ServerMessage::parse(body.fields()).into_error())
                }
                _ => return Err(Error::Protocol("unexpected message during startup".into())),
            }
        }
    }

    /// Reads one message. Cancel safe: bytes of a partly received message
    /// stay in `read_buf` for the next call.
    async fn read_backend_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(message) = BackendMessage::parse(&mut self.read_buf)? {
                return Ok(message);
            }
            self.read_buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Connection("server closed the connection".into()));
            }
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        match self.read_backend_message().await? {
            BackendMessage::Other(message) => Ok(message),
            BackendMessage::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse outside START_REPLICATION".into(),
            )),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        Ok(())
    }

    async fn next_copy_message(&mut self) -> Result<CopyRead> {
        loop {
            match self.read_message().await? {
                Message::CopyData(body) => return Ok(CopyRead::Data(body.into_bytes())),
                Message::CopyDone => {
                    self.in_copy = false;
                    return Ok(CopyRead::Done);
                }
                Message::NoticeResponse(body) => log_notice(body.fields()),
                Message::ParameterStatus(_) => {}
                Message::ErrorResponse(body) => {
                    self.in_copy = false;
                    return Err(ServerMessage::parse(body.fields()).into_error());
                }
                _ => return Err(Error::Protocol("unexpected message in copy mode".into())),
            }
        }
    }
}

fn log_notice(fields: ErrorFields<'_>) {
    let notice = ServerMessage::parse(fields);
    warn!(severity = %notice.severity, code = %notice.code, "Server notice: {}", notice.message);
}

#[async_trait]
impl ReplicationTransport for PgConnection {
    async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>> {
        debug!(query, "Simple query");
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns: Arc<[String]> = Arc::from(Vec::new());
        let mut rows = Vec::new();
        let mut error = None;

        loop {
            match self.read_message().await? {
                Message::RowDescription(body) => {
                    columns = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect::<Vec<_>>()?
                        .into();
                }
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect::<Vec<_>>()?;
                    rows.push(QueryRow::new(columns.clone(), values));
                }
                Message::CommandComplete(_) | Message::EmptyQueryResponse => {}
                Message::NoticeResponse(body) => log_notice(body.fields()),
                Message::ParameterStatus(_) => {}
                Message::ErrorResponse(body) => {
                    error = Some(ServerMessage::parse(body.fields()).into_error());
                }
                Message::ReadyForQuery(_) => {
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(rows),
                    }
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in response to {}",
                        query
                    )))
                }
            }
        }
    }

    async fn start_copy_both(&mut self, query: &str) -> Result<()> {
        debug!(query, "Starting copy-both");
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            let message = match self.read_backend_message().await? {
                BackendMessage::CopyBothResponse => {
                    self.in_copy = true;
                    return Ok(());
                }
                BackendMessage::Other(message) => message,
            };
            match message {
                Message::NoticeResponse(body) => log_notice(body.fields()),
                Message::ParameterStatus(_) => {}
                Message::ErrorResponse(body) => {
                    let error = ServerMessage::parse(body.fields()).into_error();
                    // Drain to ReadyForQuery so the connection stays usable.
                    loop {
                        if let Message::ReadyForQuery(_) = self.read_message().await? {
                            break;
                        }
                    }
                    return Err(error);
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message while entering copy mode".into(),
                    ))
                }
            }
        }
    }

    async fn recv_copy_data(&mut self, deadline: Instant) -> Result<CopyRead> {
        match tokio::time::timeout_at(deadline, self.next_copy_message()).await {
            Ok(read) => read,
            Err(_) => Ok(CopyRead::Timeout),
        }
    }

    async fn send_copy_data(&mut self, data: Bytes) -> Result<()> {
        frontend::CopyData::new(data)?.write(&mut self.write_buf);
        self.flush().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.in_copy {
            frontend::copy_done(&mut self.write_buf);
            self.in_copy = false;
        }
        frontend::terminate(&mut self.write_buf);
        if let Err(e) = self.flush().await {
            debug!("Failed to send terminate: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Failed to shut down socket: {}", e);
        }
        debug!(backend_pid = ?self.process_id, "Replication connection closed");
    }
}
