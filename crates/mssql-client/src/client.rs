//! SQL Server client implementation.
//!
//! [`Client`] owns one session: the packet connection, the token parser, the
//! [`ConnectionState`] and, once negotiated, the Always Encrypted engine.
//! Every public operation takes `&mut self`, so at most one request or bulk
//! load owns the wire at a time.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mssql_auth::AlwaysEncryptedEngine;
use mssql_codec::{CancelHandle, CodecError, Connection, Message};
use tds_protocol::token::{EnvChange, Token};
use tds_protocol::{
    Collation, EncryptionLevel, FeatureExtension, Login7, PacketType, PreLogin, ProtocolError,
    TdsVersion, TokenStreamParser,
};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::bulk::BulkLoad;
use crate::config::Config;
use crate::error::{Error, RequestError, Result, ServerError};
use crate::request::Request;
use crate::state::{AttentionReason, ConnectionState, Event};
use crate::stream::{ExecuteResult, ResultStream};
use crate::transport::{Connector, TcpConnector, Transport};

/// Outcome of one login attempt.
enum Login<T: Transport> {
    Ready(Client<T>),
    Redirect { host: String, port: u16 },
}

/// Pauses and resumes result delivery from any task.
///
/// While paused the connection stops reading from the transport and the
/// request timer does not run. Both operations are idempotent.
#[derive(Debug, Clone)]
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseHandle {
    /// Stop reading once the current token is delivered.
    pub fn pause(&self) {
        if !self.tx.send_replace(true) {
            tracing::debug!("result delivery paused");
        }
    }

    /// Continue reading.
    pub fn resume(&self) {
        if self.tx.send_replace(false) {
            tracing::debug!("result delivery resumed");
        }
    }

    /// Whether delivery is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A logged-in SQL Server session.
pub struct Client<T: Transport> {
    conn: Connection<T>,
    parser: TokenStreamParser,
    state: ConnectionState,
    config: Config,
    engine: Option<AlwaysEncryptedEngine>,
    tds_version: TdsVersion,
    database: Option<String>,
    collation: Option<Collation>,
    transaction_descriptor: u64,
    /// The last packet fed to the parser ended a message.
    message_complete: bool,
    /// An attention reached the server after its request had completed;
    /// the acknowledging DONE has not been read yet.
    late_attention: bool,
    request_timeout: Duration,
    pause: PauseHandle,
    paused: watch::Receiver<bool>,
}

impl Client<TcpStream> {
    /// Connect over plain TCP.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::connect_with(config, &TcpConnector).await
    }
}

impl<T: Transport> Client<T> {
    /// Connect using the given connector for transport and TLS.
    ///
    /// Routing redirects and transient failures are retried according to
    /// the configured [`RetryPolicy`](crate::RetryPolicy).
    pub async fn connect_with<C>(config: Config, connector: &C) -> Result<Self>
    where
        C: Connector<Stream = T>,
    {
        config.validate()?;
        let mut config = config;
        let mut attempt = 0u32;

        loop {
            match Self::try_connect(&config, connector).await {
                Ok(Login::Ready(client)) => return Ok(client),
                Ok(Login::Redirect { host, port }) => {
                    if !config.retry.should_retry(attempt) {
                        return Err(Error::Login {
                            message: format!(
                                "routing redirect to {host}:{port} exceeded {} retries",
                                config.retry.max_retries
                            ),
                            server_error: None,
                        });
                    }
                    attempt += 1;
                    tracing::info!(host = %host, port, attempt, "following routing redirect");
                    config = config.with_endpoint(&host, port);
                }
                Err(e) if e.is_transient() => {
                    if !config.retry.should_retry(attempt) {
                        return Err(Error::Login {
                            message: format!("giving up after {attempt} retries: {e}"),
                            server_error: e.server_error().cloned(),
                        });
                    }
                    attempt += 1;
                    let backoff = config.retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "login failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect<C>(config: &Config, connector: &C) -> Result<Login<T>>
    where
        C: Connector<Stream = T>,
    {
        tracing::info!(
            host = %config.host,
            port = config.port,
            database = ?config.database,
            "connecting to SQL Server"
        );

        let timeouts = &config.timeouts;
        let mut state = ConnectionState::Connecting;
        let stream = tokio::time::timeout(
            timeouts.connect_timeout,
            connector.connect(&config.host, config.port),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "failed to connect to {}:{} in {}ms",
                config.host,
                config.port,
                timeouts.connect_timeout.as_millis()
            ))
        })??;
        state = state.on(Event::TransportConnected)?;

        let packet_size = usize::from(config.packet_size);
        let mut conn = Connection::new(stream, packet_size);
        let prelogin = PreLogin::new(config.encrypt);
        conn.send_message(Message::new(PacketType::PreLogin, prelogin.encode()))
            .await?;
        let response = tokio::time::timeout(timeouts.login_timeout, conn.read_message())
            .await
            .map_err(|_| login_timeout(timeouts.login_timeout))??;
        if response.packet_type != PacketType::TabularResult {
            return Err(ProtocolError::InvalidPacketType(response.packet_type as u8).into());
        }
        let server = PreLogin::decode(&response.payload)?;
        let tls = negotiate_encryption(config.encrypt, server.encryption)?;
        tracing::debug!(client = ?config.encrypt, server = ?server.encryption, tls, "pre-login complete");
        state = state.on(Event::PreLoginResponse { tls })?;

        if tls {
            let stream = conn.into_inner()?;
            let stream = connector.upgrade_tls(stream, &config.host).await?;
            conn = Connection::new(stream, packet_size);
            state = state.on(Event::TlsHandshakeComplete)?;
        }

        let mut login = Login7::new()
            .with_packet_size(u32::from(config.packet_size))
            .with_app_name(&config.application_name)
            .with_server_name(&config.host);
        login.tds_version = config.tds_version;
        if let Some(database) = &config.database {
            login = login.with_database(database);
        }
        if config.column_encryption {
            login = login.with_feature(FeatureExtension::column_encryption());
        }
        let login = config.credentials.apply(login)?;
        conn.send_message(Message::new(PacketType::Tds7Login, login.encode()))
            .await?;

        let (tx, paused) = watch::channel(false);
        let mut client = Self {
            conn,
            parser: TokenStreamParser::new(config.tds_version),
            state,
            config: config.clone(),
            engine: None,
            tds_version: config.tds_version,
            database: None,
            collation: None,
            transaction_descriptor: 0,
            message_complete: false,
            late_attention: false,
            request_timeout: config.timeouts.command_timeout,
            pause: PauseHandle { tx: Arc::new(tx) },
            paused,
        };

        match client.process_login_response().await? {
            Some((host, port)) => Ok(Login::Redirect { host, port }),
            None => Ok(Login::Ready(client)),
        }
    }

    /// Consume the login response. Returns the routing target, if any.
    async fn process_login_response(&mut self) -> Result<Option<(String, u16)>> {
        let mut acknowledged = false;
        let mut routing = None;
        let mut server_error: Option<ServerError> = None;

        loop {
            let token = self.read_token().await?;
            match token {
                Token::LoginAck(ack) => {
                    tracing::info!(
                        version = ?ack.tds_version,
                        server = %ack.prog_name,
                        "login acknowledged"
                    );
                    self.tds_version = ack.tds_version;
                    self.parser.set_version(ack.tds_version);
                    self.apply(Event::LoginAck)?;
                    acknowledged = true;
                }
                Token::FeatureExtAck(ack) => {
                    let version = ack.column_encryption_version();
                    self.apply(Event::FeatureExtAck {
                        column_encryption: version.is_some(),
                    })?;
                    if let (Some(version), true) = (version, self.config.column_encryption) {
                        tracing::debug!(version, "column encryption negotiated");
                        self.parser.set_column_encryption(true);
                        self.engine = Some(AlwaysEncryptedEngine::new(Arc::clone(
                            &self.config.key_stores,
                        )));
                    }
                }
                Token::EnvChange(change) => {
                    if let Some(target) = self.apply_env_change(change).await {
                        routing = Some(target);
                    }
                }
                Token::Error(message) => {
                    self.apply(Event::ErrorToken)?;
                    let error = ServerError::from(message);
                    tracing::warn!(number = error.number, message = %error.message, "login error");
                    server_error.get_or_insert(error);
                }
                Token::Info(message) => {
                    tracing::debug!(number = message.number, message = %message.message, "server message");
                }
                Token::Done(done) if done.has_more() => {}
                Token::Done(done) => {
                    if acknowledged {
                        if self.config.column_encryption && self.engine.is_none() {
                            tracing::warn!("server did not acknowledge column encryption");
                        }
                        return Ok(routing);
                    }
                    self.apply(Event::DoneToken {
                        attention_ack: done.is_attention_ack(),
                        last: true,
                    })?;
                    let message = server_error.as_ref().map_or_else(
                        || "server ended the login without acknowledging it".to_owned(),
                        |e| e.message.clone(),
                    );
                    return Err(Error::Login {
                        message,
                        server_error,
                    });
                }
                other => {
                    return Err(self.protocol_failed(ProtocolError::UnexpectedToken(other.name())));
                }
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send a request and stream its results.
    ///
    /// The request is validated and encoded before anything is written; a
    /// validation failure leaves the connection idle.
    pub async fn execute<'a>(&'a mut self, request: &'a mut Request) -> Result<ResultStream<'a, T>> {
        self.ensure_ready()?;
        self.settle_attention().await?;
        let (packet_type, payload) = request
            .encode(self.engine.as_ref(), self.transaction_descriptor)
            .await?;
        self.begin(request.timeout())?;
        tracing::debug!(kind = ?request.kind(), params = request.parameters().len(), "request issued");
        if let Err(e) = self.conn.send_request(Message::new(packet_type, payload)).await {
            return Err(self.transport_failed(e));
        }
        Ok(ResultStream::new(self, request))
    }

    /// Send a request and collect all of its results.
    pub async fn run(&mut self, request: &mut Request) -> Result<ExecuteResult> {
        self.execute(request).await?.finish().await
    }

    /// Run a plain SQL batch and collect its results.
    pub async fn simple_query(&mut self, sql: &str) -> Result<ExecuteResult> {
        let mut request = Request::batch(sql);
        self.run(&mut request).await
    }

    /// Cancel whatever is executing and wait for the server to acknowledge.
    ///
    /// Useful after a [`ResultStream`] was dropped before its final DONE. Does
    /// nothing when the connection is idle.
    pub async fn cancel(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::LoggedIn => return self.settle_attention().await,
            ConnectionState::Executing => self.send_attention(AttentionReason::Cancel).await?,
            ConnectionState::Attention { .. } => {}
            state if state.is_terminal() => return Err(Error::ConnectionClosed),
            state => return Err(Error::Busy { state: state.name() }),
        }
        loop {
            match self.next_response_token().await {
                Ok(_) => {}
                Err(Error::Cancelled { .. } | Error::Timeout(_)) if self.state.is_ready() => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load rows into a table through the bulk load protocol.
    ///
    /// Runs the `insert bulk` statement, then streams COLMETADATA, one ROW
    /// per row and a final DONE. Returns the number of rows the server
    /// reports as inserted.
    pub async fn execute_bulk_load(&mut self, bulk: &mut BulkLoad) -> Result<u64> {
        self.ensure_ready()?;
        self.settle_attention().await?;
        bulk.start()?;
        let mut statement = Request::batch(bulk.sql());
        self.run(&mut statement).await?;

        self.begin(bulk.timeout())?;
        tracing::debug!(table = %bulk.table(), columns = bulk.columns().len(), "bulk load started");
        let cancel = bulk.cancellation();
        let mut encoder = bulk.encoder(self.tds_version);
        let buffered = bulk.take_rows();
        let mut receiver = bulk.take_receiver();

        let mut message = self.conn.start_message(PacketType::BulkLoad).await;
        let mut buf = BytesMut::new();
        let written: Result<()> = async {
            for row in buffered {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled());
                }
                encoder.encode_row(&row, &mut buf)?;
                message.write(&buf).await?;
                buf.clear();
            }
            if let Some(receiver) = receiver.as_mut() {
                loop {
                    let row = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(Error::cancelled()),
                        row = receiver.recv() => row,
                    };
                    let Some(row) = row else { break };
                    let values = bulk.resolve_row(row)?;
                    encoder.encode_row(&values, &mut buf)?;
                    message.write(&buf).await?;
                    buf.clear();
                }
            }
            encoder.finish(&mut buf);
            message.write(&buf).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = written {
            if e.is_fatal() {
                self.state = ConnectionState::Errored;
                return Err(e);
            }
            tracing::debug!(error = %e, rows = encoder.rows(), "bulk load aborted");
            if let Err(io) = message.abort().await {
                return Err(self.transport_failed(io));
            }
            // the ignored message gets no reply; the attention's DONE ends the request
            self.send_attention(AttentionReason::Cancel).await?;
            return match self.drain().await {
                Ok(_) | Err(Error::Cancelled { .. }) => Err(e),
                Err(other) => Err(other),
            };
        }
        if let Err(io) = message.finish().await {
            return Err(self.transport_failed(io));
        }

        let rows = self.drain().await?;
        tracing::debug!(table = %bulk.table(), rows, "bulk load complete");
        Ok(rows)
    }

    /// Read the response to the active request up to its final DONE,
    /// summing affected rows and surfacing the first server error.
    async fn drain(&mut self) -> Result<u64> {
        let mut rows = 0;
        let mut error: Option<Error> = None;
        while !self.state.is_ready() {
            match self.next_response_token().await? {
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                    rows += done.rows_affected().unwrap_or(0);
                }
                Token::Error(message) => {
                    error.get_or_insert(RequestError::Server(message.into()).into());
                }
                _ => {}
            }
        }
        error.map_or(Ok(rows), Err)
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Database reported by the server's last ENVCHANGE.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Default collation reported by the server.
    #[must_use]
    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.tds_version
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.conn.packet_size()
    }

    /// Whether Always Encrypted was negotiated.
    #[must_use]
    pub fn column_encryption_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// The Always Encrypted engine, once negotiated.
    #[must_use]
    pub fn encryption_engine(&self) -> Option<&AlwaysEncryptedEngine> {
        self.engine.as_ref()
    }

    /// Whether a transaction is open on the server.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction_descriptor != 0
    }

    /// Handle that sends an attention from another task.
    ///
    /// The running request then fails with a cancellation error once the
    /// server acknowledges.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        self.conn.cancel_handle()
    }

    /// Handle that pauses and resumes result delivery.
    #[must_use]
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Close the session.
    ///
    /// Only an idle connection can be closed; cancel or finish the active
    /// request first.
    pub async fn close(mut self) -> Result<()> {
        self.apply(Event::CloseRequested)?;
        tracing::debug!("closing connection");
        if let Err(e) = self.conn.shutdown().await {
            return Err(self.transport_failed(e));
        }
        self.apply(Event::TransportClosed)?;
        tracing::debug!(state = %self.state, "connection closed");
        Ok(())
    }

    // ========================================================================
    // Token pump
    // ========================================================================

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::LoggedIn => Ok(()),
            state if state.is_terminal() => Err(Error::ConnectionClosed),
            state => Err(Error::Busy { state: state.name() }),
        }
    }

    fn begin(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.apply(Event::RequestIssued)?;
        self.request_timeout = timeout.unwrap_or(self.config.timeouts.command_timeout);
        self.message_complete = false;
        Ok(())
    }

    fn apply(&mut self, event: Event) -> Result<()> {
        self.state = self.state.on(event)?;
        Ok(())
    }

    /// Next token for the active request.
    ///
    /// Connection-level tokens are handled here. While an attention is
    /// outstanding every token up to its acknowledgement is discarded, and
    /// the acknowledgement itself surfaces as the cancellation or timeout
    /// error.
    pub(crate) async fn next_response_token(&mut self) -> Result<Token> {
        loop {
            let token = self.read_token().await?;

            if self.state == ConnectionState::Executing && self.conn.attention_pending() {
                // sent through a CancelHandle
                self.apply(Event::CancelRequested)?;
            }

            if let ConnectionState::Attention { reason } = self.state {
                match &token {
                    Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done)
                        if done.is_attention_ack() =>
                    {
                        self.conn.clear_attention();
                        self.apply(Event::DoneToken {
                            attention_ack: true,
                            last: true,
                        })?;
                        tracing::debug!(?reason, "attention acknowledged");
                        return Err(match reason {
                            AttentionReason::Cancel => Error::cancelled(),
                            AttentionReason::Timeout => Error::Timeout(format!(
                                "request failed to complete in {}ms",
                                self.request_timeout.as_millis()
                            )),
                        });
                    }
                    Token::EnvChange(_) => {}
                    other => {
                        tracing::trace!(token = other.name(), "discarding token while attention is pending");
                        continue;
                    }
                }
            }

            match token {
                Token::EnvChange(change) => {
                    self.apply_env_change(change).await;
                    continue;
                }
                Token::Info(message) => {
                    tracing::info!(
                        number = message.number,
                        message = %message.message,
                        "server message"
                    );
                    continue;
                }
                Token::LoginAck(_)
                | Token::FeatureExtAck(_)
                | Token::Sspi(_)
                | Token::FedAuthInfo(_) => {
                    return Err(self.protocol_failed(ProtocolError::UnexpectedToken(token.name())));
                }
                _ => {}
            }

            let event = match &token {
                Token::Done(done) | Token::DoneProc(done) => Some(Event::DoneToken {
                    attention_ack: done.is_attention_ack(),
                    last: !done.has_more(),
                }),
                Token::DoneInProc(_) => Some(Event::DoneToken {
                    attention_ack: false,
                    last: false,
                }),
                Token::Error(_) => Some(Event::ErrorToken),
                _ => None,
            };
            if let Some(event) = event {
                self.apply(event)?;
                if self.state.is_ready() && self.conn.end_request() {
                    // a cancel handle fired after the final DONE was read
                    tracing::debug!("attention arrived after the request completed");
                    self.late_attention = true;
                }
            }
            return Ok(token);
        }
    }

    /// Send an attention for the active request.
    pub(crate) async fn send_attention(&mut self, reason: AttentionReason) -> Result<()> {
        if self.state != ConnectionState::Executing {
            return Ok(());
        }
        self.apply(match reason {
            AttentionReason::Cancel => Event::CancelRequested,
            AttentionReason::Timeout => Event::Timeout,
        })?;
        match self.conn.send_attention().await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(?reason, "attention already sent for this request");
                Ok(())
            }
            Err(e) => Err(self.transport_failed(e)),
        }
    }

    /// Read and discard the acknowledgement of a late attention, so it is
    /// not taken for the cancellation of the next request.
    async fn settle_attention(&mut self) -> Result<()> {
        if !self.late_attention {
            return Ok(());
        }
        tracing::debug!("waiting for the acknowledgement of a late attention");
        self.message_complete = false;
        loop {
            match self.read_token().await? {
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done)
                    if done.is_attention_ack() =>
                {
                    self.late_attention = false;
                    return Ok(());
                }
                Token::EnvChange(change) => {
                    self.apply_env_change(change).await;
                }
                other => {
                    tracing::trace!(token = other.name(), "discarding token before attention acknowledgement");
                }
            }
        }
    }

    /// Decode the next token, reading packets as needed.
    async fn read_token(&mut self) -> Result<Token> {
        loop {
            match self.parser.next_token() {
                Ok(Some(token)) => return Ok(token),
                Ok(None) if self.message_complete && self.parser.buffered() > 0 => {
                    let trailing = self.parser.buffered();
                    return Err(self.protocol_failed(ProtocolError::TrailingBytes(trailing)));
                }
                Ok(None) => self.fill().await?,
                Err(e) => return Err(self.protocol_failed(e)),
            }
        }
    }

    /// Feed the next packet to the parser, running the packet timer.
    async fn fill(&mut self) -> Result<()> {
        loop {
            if self.state == ConnectionState::Executing {
                // no timer runs while paused
                if self.paused.wait_for(|paused| !*paused).await.is_err() {
                    return Err(Error::ConnectionClosed);
                }
            }
            let wait = self.read_timeout();
            match tokio::time::timeout(wait, self.conn.read_packet()).await {
                Ok(Ok(packet)) => {
                    tracing::trace!(len = packet.payload.len(), eom = packet.is_end_of_message(), "packet received");
                    self.parser.feed(&packet.payload);
                    self.message_complete = packet.is_end_of_message();
                    if self.message_complete {
                        self.parser.end_of_message();
                    }
                    return Ok(());
                }
                Ok(Err(e)) => return Err(self.transport_failed(e)),
                Err(_elapsed) => self.expire(wait).await?,
            }
        }
    }

    fn read_timeout(&self) -> Duration {
        match self.state {
            ConnectionState::Executing => self.request_timeout,
            ConnectionState::Attention { .. } | ConnectionState::Closing => {
                self.config.timeouts.cancel_timeout
            }
            ConnectionState::LoggedIn if self.late_attention => self.config.timeouts.cancel_timeout,
            _ => self.config.timeouts.login_timeout,
        }
    }

    /// The packet timer ran out.
    async fn expire(&mut self, waited: Duration) -> Result<()> {
        let waited_ms = waited.as_millis();
        match self.state {
            ConnectionState::Executing => {
                tracing::warn!(timeout_ms = waited_ms as u64, "request timed out, sending attention");
                self.send_attention(AttentionReason::Timeout).await
            }
            ConnectionState::Attention { .. } => {
                self.apply(Event::Timeout)?;
                tracing::error!(timeout_ms = waited_ms as u64, "attention was not acknowledged");
                Err(Error::Timeout(format!(
                    "attention was not acknowledged within {waited_ms}ms"
                )))
            }
            ConnectionState::LoggedIn if self.late_attention => {
                self.state = ConnectionState::Errored;
                tracing::error!(timeout_ms = waited_ms as u64, "late attention was not acknowledged");
                Err(Error::Timeout(format!(
                    "attention was not acknowledged within {waited_ms}ms"
                )))
            }
            _ => {
                self.state = ConnectionState::Errored;
                Err(login_timeout(waited))
            }
        }
    }

    /// Apply an ENVCHANGE. Returns the routing target for a redirect.
    async fn apply_env_change(&mut self, change: EnvChange) -> Option<(String, u16)> {
        match change {
            EnvChange::Database { new, .. } => {
                tracing::debug!(database = %new, "database changed");
                self.database = Some(new);
            }
            EnvChange::Language { new, .. } => {
                tracing::debug!(language = %new, "language changed");
            }
            EnvChange::PacketSize { new, .. } => {
                tracing::debug!(packet_size = new, "packet size changed");
                let size = usize::try_from(new).unwrap_or(usize::from(u16::MAX));
                self.conn.set_packet_size(size).await;
            }
            EnvChange::SqlCollation(collation) => self.collation = collation,
            EnvChange::BeginTransaction(descriptor) => {
                tracing::debug!(descriptor, "transaction started");
                self.transaction_descriptor = descriptor;
            }
            EnvChange::CommitTransaction | EnvChange::RollbackTransaction => {
                tracing::debug!("transaction ended");
                self.transaction_descriptor = 0;
            }
            EnvChange::ResetConnectionAck => tracing::debug!("connection reset acknowledged"),
            EnvChange::Routing { host, port } => {
                tracing::info!(host = %host, port, "routing redirect received");
                return Some((host, port));
            }
            EnvChange::Other { env_type, .. } => {
                tracing::trace!(env_type, "ignoring environment change");
            }
        }
        None
    }

    fn transport_failed(&mut self, e: CodecError) -> Error {
        let event = match e {
            CodecError::ConnectionClosed { .. } => Event::TransportClosed,
            _ => Event::TransportError,
        };
        self.state = self.state.on(event).unwrap_or(ConnectionState::Errored);
        tracing::error!(error = %e, state = %self.state, "transport failed");
        e.into()
    }

    fn protocol_failed(&mut self, e: ProtocolError) -> Error {
        tracing::error!(error = %e, state = %self.state, "protocol violation, closing connection");
        self.state = ConnectionState::Errored;
        e.into()
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("tds_version", &self.tds_version)
            .field("database", &self.database)
            .field("column_encryption", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

fn login_timeout(waited: Duration) -> Error {
    Error::Timeout(format!("login did not complete within {}ms", waited.as_millis()))
}

/// Decide from both PRELOGIN answers whether TLS follows.
fn negotiate_encryption(client: EncryptionLevel, server: EncryptionLevel) -> Result<bool> {
    use EncryptionLevel as E;

    let refuse = |message: &str| Error::Login {
        message: message.to_owned(),
        server_error: None,
    };
    match (client, server) {
        (E::NotSupported | E::Off, E::NotSupported) | (E::NotSupported, E::Off) => Ok(false),
        (E::NotSupported, E::On | E::Required) => {
            Err(refuse("server requires encryption but the client does not support it"))
        }
        (E::Off, E::Off) => Err(refuse("login-only encryption is not supported")),
        (E::On | E::Required, E::NotSupported) => {
            Err(refuse("client requires encryption but the server does not support it"))
        }
        _ => Ok(true),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_encryption() {
        use EncryptionLevel as E;

        assert!(!negotiate_encryption(E::NotSupported, E::NotSupported).unwrap());
        assert!(!negotiate_encryption(E::Off, E::NotSupported).unwrap());
        assert!(negotiate_encryption(E::On, E::Off).unwrap());
        assert!(negotiate_encryption(E::Off, E::Required).unwrap());
        assert!(negotiate_encryption(E::NotSupported, E::Required).is_err());
        assert!(negotiate_encryption(E::Required, E::NotSupported).is_err());
        assert!(negotiate_encryption(E::Off, E::Off).is_err());
    }

    #[test]
    fn test_pause_handle_is_idempotent() {
        let (tx, rx) = watch::channel(false);
        let handle = PauseHandle { tx: Arc::new(tx) };
        handle.pause();
        handle.pause();
        assert!(handle.is_paused());
        assert!(*rx.borrow());
        handle.resume();
        handle.resume();
        assert!(!handle.is_paused());
    }
}
