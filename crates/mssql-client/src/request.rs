//! Requests and their parameters.
//!
//! A [`Request`] is SQL text or a procedure name plus an ordered parameter
//! list. Ad-hoc SQL goes out as `sp_executesql`; the prepared statement flow
//! moves the same request through `sp_prepare`, `sp_execute` and
//! `sp_unprepare` in place:
//!
//! ```rust,ignore
//! let mut request = Request::new("SELECT name FROM users WHERE id = @id")
//!     .parameter("id", TypeDescriptor::Int, 0);
//! request.prepare();
//! client.execute(&mut request).await?.finish().await?;
//!
//! request.execute([("id", 7)])?;
//! let rows = client.execute(&mut request).await?.finish().await?;
//! ```

use std::time::Duration;

use bytes::Bytes;
use mssql_auth::{AlwaysEncryptedEngine, EncryptionError};
use mssql_types::{SqlValue, ToSql, TypeDescriptor};
use tds_protocol::{CryptoMetadata, PacketType, RpcParam, RpcRequest, encode_sql_batch};

use crate::error::{Error, RequestError};

/// One request parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Name without the leading `@`.
    pub name: String,
    /// Declared type.
    pub descriptor: TypeDescriptor,
    /// Current value.
    pub value: SqlValue,
    /// Whether the server returns a value for it.
    pub output: bool,
    /// Encryption metadata when the target column is protected.
    pub crypto: Option<CryptoMetadata>,
}

impl Parameter {
    /// An input parameter.
    pub fn new(name: &str, descriptor: TypeDescriptor, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.strip_prefix('@').unwrap_or(name).to_owned(),
            descriptor,
            value: value.into(),
            output: false,
            crypto: None,
        }
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn output(mut self) -> Self {
        self.output = true;
        self
    }

    /// Encrypt the value with the given column metadata.
    #[must_use]
    pub fn with_crypto(mut self, crypto: CryptoMetadata) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// `@name type [OUTPUT]`
    fn declaration(&self) -> String {
        let mut decl = format!("@{} {}", self.name, self.descriptor.declaration());
        if self.output {
            decl.push_str(" OUTPUT");
        }
        decl
    }

    fn validate(&self) -> Result<SqlValue, RequestError> {
        self.descriptor
            .validate(&self.value)
            .map_err(|e| RequestError::param(&self.name, e))
    }

    async fn to_rpc(&self, engine: Option<&AlwaysEncryptedEngine>) -> Result<RpcParam, Error> {
        let value = self.validate()?;
        let wire_name = format!("@{}", self.name);

        let param = match (&self.crypto, engine) {
            (Some(meta), None) if meta.is_encrypted() => {
                return Err(EncryptionError::NotEnabled.into());
            }
            (Some(meta), Some(engine)) if meta.is_encrypted() => {
                match engine.encrypt(&value, meta).await? {
                    Some(ciphertext) => RpcParam::encrypted(wire_name, ciphertext, meta.clone()),
                    None => {
                        let mut param =
                            RpcParam::encrypted(wire_name, Bytes::new(), meta.clone());
                        param.value = None;
                        param
                    }
                }
            }
            _ => {
                let bytes = self
                    .descriptor
                    .encode(&value)
                    .map_err(|e| RequestError::param(&self.name, e))?;
                RpcParam::new(wire_name, self.descriptor.type_info(), bytes)
            }
        };

        Ok(if self.output { param.as_output() } else { param })
    }
}

/// What a request runs as on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// A plain SQL batch without parameters.
    Batch,
    /// `sp_executesql`.
    ExecuteSql,
    /// A stored procedure call.
    Procedure(String),
    /// `sp_prepare`.
    Prepare,
    /// `sp_execute` with the prepared handle.
    Execute,
    /// `sp_unprepare`.
    Unprepare,
}

/// A SQL statement or procedure call with its parameters.
#[derive(Debug, Clone)]
pub struct Request {
    sql: String,
    kind: RequestKind,
    params: Vec<Parameter>,
    handle: Option<i32>,
    timeout: Option<Duration>,
}

impl Request {
    /// Parameterized SQL, sent through `sp_executesql`.
    pub fn new(sql: impl Into<String>) -> Self {
        Self::with_kind(sql.into(), RequestKind::ExecuteSql)
    }

    /// A plain SQL batch.
    pub fn batch(sql: impl Into<String>) -> Self {
        Self::with_kind(sql.into(), RequestKind::Batch)
    }

    /// A stored procedure call.
    pub fn procedure(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_kind(name.clone(), RequestKind::Procedure(name))
    }

    fn with_kind(sql: String, kind: RequestKind) -> Self {
        Self {
            sql,
            kind,
            params: Vec::new(),
            handle: None,
            timeout: None,
        }
    }

    /// Add an input parameter.
    #[must_use]
    pub fn parameter(
        mut self,
        name: &str,
        descriptor: TypeDescriptor,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.add_parameter(Parameter::new(name, descriptor, value));
        self
    }

    /// Add an output parameter.
    #[must_use]
    pub fn output_parameter(
        mut self,
        name: &str,
        descriptor: TypeDescriptor,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.add_parameter(Parameter::new(name, descriptor, value).output());
        self
    }

    /// Add an input parameter typed after its value.
    pub fn bind(self, name: &str, value: &dyn ToSql) -> Result<Self, Error> {
        let sql_value = value.to_sql().map_err(|e| RequestError::param(name, e))?;
        Ok(self.parameter(name, value.descriptor(), sql_value))
    }

    /// Append a parameter. Wire order is insertion order.
    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.params.push(parameter);
    }

    /// Turn the request into `sp_prepare`. Run it to obtain the handle.
    pub fn prepare(&mut self) {
        self.kind = RequestKind::Prepare;
    }

    /// Turn a prepared request into `sp_execute`, assigning `values` by
    /// parameter name.
    ///
    /// Every parameter is validated here, so a bad value fails before
    /// anything is sent. On failure the request is left as it was.
    pub fn execute<I, K, V>(&mut self, values: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<SqlValue>,
    {
        if self.handle.is_none() {
            return Err(RequestError::invalid_state("the request has not been prepared").into());
        }
        let mut staged: Vec<Option<SqlValue>> = vec![None; self.params.len()];
        for (name, value) in values {
            let name = name.as_ref();
            let name = name.strip_prefix('@').unwrap_or(name);
            let index = self
                .params
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| RequestError::param(name, "No such parameter."))?;
            staged[index] = Some(value.into());
        }
        for (param, value) in self.params.iter().zip(&staged) {
            let value = value.as_ref().unwrap_or(&param.value);
            param
                .descriptor
                .validate(value)
                .map_err(|e| RequestError::param(&param.name, e))?;
        }
        for (param, value) in self.params.iter_mut().zip(staged) {
            if let Some(value) = value {
                param.value = value;
            }
        }
        self.kind = RequestKind::Execute;
        Ok(())
    }

    /// Turn a prepared request into `sp_unprepare`.
    pub fn unprepare(&mut self) -> Result<(), Error> {
        if self.handle.is_none() {
            return Err(RequestError::invalid_state("the request has not been prepared").into());
        }
        self.kind = RequestKind::Unprepare;
        Ok(())
    }

    /// Override the command timeout for this request.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The timeout override, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The handle returned by `sp_prepare`.
    #[must_use]
    pub fn handle(&self) -> Option<i32> {
        self.handle
    }

    /// SQL text, or the procedure name.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// What the request currently runs as.
    #[must_use]
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Parameters in declaration order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub(crate) fn parameter_named(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub(crate) fn set_handle(&mut self, handle: i32) {
        tracing::debug!(handle, "prepared statement handle assigned");
        self.handle = Some(handle);
    }

    /// Called once the server has answered.
    pub(crate) fn completed(&mut self) {
        if self.kind == RequestKind::Unprepare {
            self.handle = None;
        }
    }

    /// The parameter list as declared to the server, e.g.
    /// `@a int, @b nvarchar(4000) OUTPUT`.
    #[must_use]
    pub fn declarations(&self) -> String {
        self.params
            .iter()
            .map(Parameter::declaration)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build the outbound message payload.
    pub(crate) async fn encode(
        &self,
        engine: Option<&AlwaysEncryptedEngine>,
        transaction_descriptor: u64,
    ) -> Result<(PacketType, Bytes), Error> {
        let rpc = match &self.kind {
            RequestKind::Batch => {
                if !self.params.is_empty() {
                    return Err(RequestError::invalid_state(
                        "a SQL batch cannot carry parameters",
                    )
                    .into());
                }
                return Ok((
                    PacketType::SqlBatch,
                    encode_sql_batch(&self.sql, transaction_descriptor),
                ));
            }
            RequestKind::ExecuteSql => {
                let params = self.rpc_params(engine).await?;
                RpcRequest::execute_sql(&self.sql, &self.declarations(), params)
            }
            RequestKind::Procedure(name) => {
                let params = self.rpc_params(engine).await?;
                params
                    .into_iter()
                    .fold(RpcRequest::named(name.as_str()), RpcRequest::param)
            }
            RequestKind::Prepare => RpcRequest::prepare(&self.sql, &self.declarations()),
            RequestKind::Execute => {
                let handle = self.require_handle()?;
                RpcRequest::execute(handle, self.rpc_params(engine).await?)
            }
            RequestKind::Unprepare => RpcRequest::unprepare(self.require_handle()?),
        };
        Ok((PacketType::Rpc, rpc.encode(transaction_descriptor)))
    }

    async fn rpc_params(
        &self,
        engine: Option<&AlwaysEncryptedEngine>,
    ) -> Result<Vec<RpcParam>, Error> {
        // validate everything before encrypting anything
        for param in &self.params {
            param.validate()?;
        }
        let mut params = Vec::with_capacity(self.params.len());
        for param in &self.params {
            params.push(param.to_rpc(engine).await?);
        }
        Ok(params)
    }

    fn require_handle(&self) -> Result<i32, Error> {
        self.handle
            .ok_or_else(|| RequestError::invalid_state("the request has not been prepared").into())
    }
}
