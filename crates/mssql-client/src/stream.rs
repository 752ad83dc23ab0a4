//! Streaming access to a request's results.
//!
//! [`ResultStream`] hands out the response one item at a time in server
//! order. It borrows the client for its whole lifetime; dropping it before
//! the final DONE leaves the connection busy until [`Client::cancel`] drains
//! the rest.

use std::sync::Arc;

use mssql_types::{SqlValue, decode_value};
use tds_protocol::token::{ColMetaData, ReturnValue, Token};

use crate::client::Client;
use crate::error::{Error, RequestError, Result, ServerError};
use crate::request::{Request, RequestKind};
use crate::row::{Column, Row, columns_of, materialize};
use crate::state::AttentionReason;
use crate::transport::Transport;

/// An output parameter returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParam {
    /// Parameter name without the leading `@`.
    pub name: String,
    /// Returned value.
    pub value: SqlValue,
}

/// One item of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultItem {
    /// A result set starts.
    Columns(Arc<[Column]>),
    /// A row of the current result set.
    Row(Row),
    /// A statement finished.
    Done {
        /// Rows affected, when the server reported a count.
        rows_affected: Option<u64>,
        /// Whether more results follow.
        more: bool,
    },
    /// An output parameter.
    Output(OutputParam),
    /// A stored procedure's return status.
    ReturnStatus(i32),
}

/// Rows of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    /// Column metadata.
    pub columns: Arc<[Column]>,
    /// Rows in server order.
    pub rows: Vec<Row>,
}

/// Everything a request produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    /// Result sets in server order.
    pub result_sets: Vec<ResultSet>,
    /// Total rows affected across all statements.
    pub rows_affected: u64,
    /// Output parameters.
    pub output_params: Vec<OutputParam>,
    /// Return status of a procedure call.
    pub return_status: Option<i32>,
}

impl ExecuteResult {
    /// Rows of the first result set.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        self.result_sets.first().map_or(&[], |set| &set.rows)
    }

    /// Output parameter by name, without the `@`.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&SqlValue> {
        self.output_params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// The response to one request.
pub struct ResultStream<'a, T: Transport> {
    client: &'a mut Client<T>,
    request: &'a mut Request,
    metadata: Option<(Arc<ColMetaData>, Arc<[Column]>)>,
    /// First failure, reported once the response is complete.
    error: Option<Error>,
    /// A row or output value could not be decoded or decrypted. The request
    /// has failed and the rest of its response is discarded.
    failed: bool,
    finished: bool,
}

impl<'a, T: Transport> ResultStream<'a, T> {
    pub(crate) fn new(client: &'a mut Client<T>, request: &'a mut Request) -> Self {
        Self {
            client,
            request,
            metadata: None,
            error: None,
            failed: false,
            finished: false,
        }
    }

    /// Next item, or `None` after the final DONE.
    ///
    /// A server ERROR token does not end the stream: the remaining items are
    /// still delivered and the error is returned in place of `None`. A value
    /// that cannot be decoded or decrypted does: nothing after it is
    /// delivered, and the error follows the final DONE.
    pub async fn next(&mut self) -> Result<Option<ResultItem>> {
        loop {
            if self.finished {
                return self.error.take().map_or(Ok(None), Err);
            }

            let token = match self.client.next_response_token().await {
                Ok(token) => token,
                Err(e) => {
                    self.finished = true;
                    self.error = None;
                    self.request.completed();
                    return Err(e);
                }
            };

            if self.failed {
                if matches!(token, Token::Done(_) | Token::DoneProc(_))
                    && self.client.state().is_ready()
                {
                    self.finished = true;
                    self.request.completed();
                }
                continue;
            }

            match token {
                Token::ColMetaData(meta) => {
                    let columns = columns_of(&meta);
                    self.metadata = Some((meta, Arc::clone(&columns)));
                    return Ok(Some(ResultItem::Columns(columns)));
                }
                Token::Row(raw) => {
                    let Some((meta, columns)) = &self.metadata else {
                        continue;
                    };
                    match materialize(columns, meta, raw, self.client.encryption_engine()).await {
                        Ok(row) => return Ok(Some(ResultItem::Row(row))),
                        Err(e) => {
                            tracing::warn!(error = %e, "row could not be decoded, discarding the response");
                            self.fail(e);
                        }
                    }
                }
                Token::Done(done) | Token::DoneProc(done) => {
                    if self.client.state().is_ready() {
                        self.finished = true;
                        self.request.completed();
                    }
                    return Ok(Some(ResultItem::Done {
                        rows_affected: done.rows_affected(),
                        more: done.has_more(),
                    }));
                }
                Token::DoneInProc(done) => {
                    return Ok(Some(ResultItem::Done {
                        rows_affected: done.rows_affected(),
                        more: true,
                    }));
                }
                Token::Error(message) => {
                    let error = ServerError::from(message);
                    tracing::debug!(number = error.number, class = error.class, "request error");
                    self.record(RequestError::Server(error).into());
                }
                Token::ReturnStatus(status) => return Ok(Some(ResultItem::ReturnStatus(status))),
                Token::ReturnValue(value) => {
                    if let Some(output) = self.output(value).await {
                        return Ok(Some(ResultItem::Output(output)));
                    }
                }
                // ORDER, COLINFO, TABNAME and similar carry nothing for the caller
                _ => {}
            }
        }
    }

    /// Next row, skipping everything else.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        while let Some(item) = self.next().await? {
            if let ResultItem::Row(row) = item {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Read the rest of the response.
    pub async fn finish(mut self) -> Result<ExecuteResult> {
        let mut result = ExecuteResult::default();
        while let Some(item) = self.next().await? {
            match item {
                ResultItem::Columns(columns) => result.result_sets.push(ResultSet {
                    columns,
                    rows: Vec::new(),
                }),
                ResultItem::Row(row) => {
                    if let Some(set) = result.result_sets.last_mut() {
                        set.rows.push(row);
                    }
                }
                ResultItem::Done { rows_affected, .. } => {
                    result.rows_affected += rows_affected.unwrap_or(0);
                }
                ResultItem::Output(param) => result.output_params.push(param),
                ResultItem::ReturnStatus(status) => result.return_status = Some(status),
            }
        }
        Ok(result)
    }

    /// Ask the server to stop. The stream then yields the cancellation error
    /// once the server acknowledges; items already in flight are discarded.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.client.send_attention(AttentionReason::Cancel).await
    }

    /// Stop reading from the transport until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.client.pause_handle().pause();
    }

    /// Continue reading.
    pub fn resume(&self) {
        self.client.pause_handle().resume();
    }

    /// Whether the final DONE was received.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fail the request; `error` replaces any server error already recorded.
    fn fail(&mut self, error: Error) {
        self.failed = true;
        self.error = Some(error);
    }

    fn record(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Turn a RETURNVALUE into an output parameter.
    ///
    /// `sp_prepare` answers with the statement handle, which is stored on the
    /// request instead of being reported.
    async fn output(&mut self, value: ReturnValue) -> Option<OutputParam> {
        let name = value.param_name().to_owned();

        if self.request.kind() == &RequestKind::Prepare {
            if name == "handle" {
                match decode_value(&value.type_info, value.value) {
                    Ok(SqlValue::Int(handle)) => self.request.set_handle(handle),
                    Ok(other) => self.record(
                        RequestError::invalid_state(format!(
                            "sp_prepare returned a {} handle",
                            other.type_name()
                        ))
                        .into(),
                    ),
                    Err(e) => self.record(e.into()),
                }
            } else {
                self.record(
                    RequestError::invalid_state(format!(
                        "Unexpected output parameter {name} from sp_prepare"
                    ))
                    .into(),
                );
            }
            return None;
        }

        let decoded = match (value.crypto, value.value, self.client.encryption_engine()) {
            (Some(mut crypto), Some(cell), Some(engine)) if crypto.is_encrypted() => {
                // RETURNVALUE carries no CEK table; the key comes from the parameter
                if crypto.cek.is_none() {
                    crypto.cek = self
                        .request
                        .parameter_named(&name)
                        .and_then(|p| p.crypto.as_ref())
                        .and_then(|c| c.cek.clone());
                }
                engine.decrypt(&cell, &crypto).await.map_err(Error::from)
            }
            (Some(_), None, _) => Ok(SqlValue::Null),
            (_, cell, _) => decode_value(&value.type_info, cell).map_err(Error::from),
        };

        match decoded {
            Ok(value) => Some(OutputParam { name, value }),
            Err(e) => {
                tracing::warn!(error = %e, param = %name, "output parameter could not be decoded");
                self.fail(e);
                None
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for ResultStream<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("state", &self.client.state())
            .field("finished", &self.finished)
            .field("pending_error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}
