//! Minimal HiveServer2 thrift binary protocol
//!
//! Hand-encoded subset of TCLIService over an unframed socket in NOSASL
//! mode: OpenSession, ExecuteStatement and CloseSession are the only calls
//! the operator needs for DDL. Unknown response fields are skipped
//! generically, so server-side additions do not break decoding.

use async_trait::async_trait;
use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use tally_common::{Error, Result};

use super::{HiveConnection, HiveConnector};

// TBinaryProtocol strict-mode version word.
const VERSION_1: u32 = 0x8001_0000;

const MSG_CALL: u8 = 1;
const MSG_REPLY: u8 = 2;
const MSG_EXCEPTION: u8 = 3;

// TType ids.
const T_STOP: u8 = 0;
const T_BOOL: u8 = 2;
const T_BYTE: u8 = 3;
const T_DOUBLE: u8 = 4;
const T_I16: u8 = 6;
const T_I32: u8 = 8;
const T_I64: u8 = 10;
const T_STRING: u8 = 11;
const T_STRUCT: u8 = 12;
const T_MAP: u8 = 13;
const T_SET: u8 = 14;
const T_LIST: u8 = 15;

// HIVE_CLI_SERVICE_PROTOCOL_V10
const PROTOCOL_VERSION: i32 = 9;

// TStatusCode
const STATUS_SUCCESS: i32 = 0;
const STATUS_SUCCESS_WITH_INFO: i32 = 1;

/// Session identity returned by OpenSession.
#[derive(Debug, Default, Clone)]
struct SessionHandle {
    guid: Vec<u8>,
    secret: Vec<u8>,
}

#[derive(Debug, Default)]
struct TStatus {
    code: i32,
    error_message: Option<String>,
}

/// Connector dialing a `host:port` HiveServer2 endpoint.
pub struct ThriftConnector {
    host: String,
}

impl ThriftConnector {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl HiveConnector for ThriftConnector {
    async fn connect(&self) -> Result<Box<dyn HiveConnection>> {
        let stream = TcpStream::connect(&self.host).await?;
        let mut conn = ThriftHiveConnection {
            stream: BufStream::new(stream),
            session: SessionHandle::default(),
            seq: 0,
        };
        conn.open_session().await?;
        Ok(Box::new(conn))
    }
}

pub struct ThriftHiveConnection {
    stream: BufStream<TcpStream>,
    session: SessionHandle,
    seq: i32,
}

impl ThriftHiveConnection {
    async fn open_session(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let mut buf = Vec::new();
        write_message_begin(&mut buf, "OpenSession", MSG_CALL, seq);
        // args struct, field 1: TOpenSessionReq
        write_field_begin(&mut buf, T_STRUCT, 1);
        {
            // field 1: client_protocol
            write_field_begin(&mut buf, T_I32, 1);
            buf.put_i32(PROTOCOL_VERSION);
            write_stop(&mut buf);
        }
        write_stop(&mut buf);
        self.send(&buf).await?;

        self.read_reply_header("OpenSession").await?;
        let mut status = TStatus::default();
        let mut session = SessionHandle::default();
        // reply struct
        loop {
            let (ttype, id) = self.read_field_header().await?;
            match (ttype, id) {
                (T_STOP, _) => break,
                // field 0: TOpenSessionResp
                (T_STRUCT, 0) => loop {
                    let (rtype, rid) = self.read_field_header().await?;
                    match (rtype, rid) {
                        (T_STOP, _) => break,
                        (T_STRUCT, 1) => status = self.read_t_status().await?,
                        (T_STRUCT, 3) => session = self.read_session_handle().await?,
                        _ => self.skip(rtype).await?,
                    }
                },
                _ => self.skip(ttype).await?,
            }
        }
        Self::check_status(status)?;
        if session.guid.is_empty() {
            return Err(Error::QueryFailed(
                "hive returned no session handle".into(),
            ));
        }
        self.session = session;
        Ok(())
    }

    fn next_seq(&mut self) -> i32 {
        self.seq += 1;
        self.seq
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply_header(&mut self, method: &str) -> Result<()> {
        let word = self.stream.read_u32().await?;
        if word & 0x8000_0000 == 0 {
            return Err(Error::QueryFailed(
                "hive spoke non-strict thrift framing".into(),
            ));
        }
        if word & 0xffff_0000 != VERSION_1 {
            return Err(Error::QueryFailed(format!(
                "unsupported thrift version word {word:#x}"
            )));
        }
        let message_type = (word & 0xff) as u8;
        let name = self.read_string().await?;
        let _seq = self.stream.read_i32().await?;
        if message_type == MSG_EXCEPTION {
            let exc = self.read_application_exception().await?;
            return Err(Error::QueryFailed(format!("{method} failed: {exc}")));
        }
        if message_type != MSG_REPLY || name != method {
            return Err(Error::QueryFailed(format!(
                "unexpected thrift reply {name:?} to {method}"
            )));
        }
        Ok(())
    }

    async fn read_application_exception(&mut self) -> Result<String> {
        let mut message = String::from("unknown application exception");
        loop {
            let (ttype, id) = self.read_field_header().await?;
            if ttype == T_STOP {
                break;
            }
            if ttype == T_STRING && id == 1 {
                message = self.read_string().await?;
            } else {
                self.skip(ttype).await?;
            }
        }
        Ok(message)
    }

    async fn read_field_header(&mut self) -> Result<(u8, i16)> {
        let ttype = self.stream.read_u8().await?;
        if ttype == T_STOP {
            return Ok((T_STOP, 0));
        }
        let id = self.stream.read_i16().await?;
        Ok((ttype, id))
    }

    async fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary().await?;
        String::from_utf8(bytes)
            .map_err(|err| Error::QueryFailed(format!("invalid utf-8 from hive: {err}")))
    }

    async fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.stream.read_i32().await?;
        if !(0..=16 * 1024 * 1024).contains(&len) {
            return Err(Error::QueryFailed(format!(
                "implausible thrift string length {len}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.stream.read_exact(&mut bytes).await?;
        Ok(bytes)
    }

    async fn read_t_status(&mut self) -> Result<TStatus> {
        let mut status = TStatus::default();
        loop {
            let (ttype, id) = self.read_field_header().await?;
            match (ttype, id) {
                (T_STOP, _) => break,
                (T_I32, 1) => status.code = self.stream.read_i32().await?,
                (T_STRING, 5) => status.error_message = Some(self.read_string().await?),
                _ => self.skip(ttype).await?,
            }
        }
        Ok(status)
    }

    async fn read_session_handle(&mut self) -> Result<SessionHandle> {
        let mut handle = SessionHandle::default();
        loop {
            let (ttype, id) = self.read_field_header().await?;
            match (ttype, id) {
                (T_STOP, _) => break,
                // field 1: THandleIdentifier
                (T_STRUCT, 1) => loop {
                    let (itype, iid) = self.read_field_header().await?;
                    match (itype, iid) {
                        (T_STOP, _) => break,
                        (T_STRING, 1) => handle.guid = self.read_binary().await?,
                        (T_STRING, 2) => handle.secret = self.read_binary().await?,
                        _ => self.skip(itype).await?,
                    }
                },
                _ => self.skip(ttype).await?,
            }
        }
        Ok(handle)
    }

    /// Skip one value of the given thrift type.
    fn skip<'a>(
        &'a mut self,
        ttype: u8,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match ttype {
                T_BOOL | T_BYTE => {
                    self.stream.read_u8().await?;
                }
                T_I16 => {
                    self.stream.read_i16().await?;
                }
                T_I32 => {
                    self.stream.read_i32().await?;
                }
                T_I64 | T_DOUBLE => {
                    self.stream.read_i64().await?;
                }
                T_STRING => {
                    self.read_binary().await?;
                }
                T_STRUCT => loop {
                    let (ftype, _) = self.read_field_header().await?;
                    if ftype == T_STOP {
                        break;
                    }
                    self.skip(ftype).await?;
                },
                T_MAP => {
                    let ktype = self.stream.read_u8().await?;
                    let vtype = self.stream.read_u8().await?;
                    let size = self.stream.read_i32().await?;
                    for _ in 0..size {
                        self.skip(ktype).await?;
                        self.skip(vtype).await?;
                    }
                }
                T_LIST | T_SET => {
                    let etype = self.stream.read_u8().await?;
                    let size = self.stream.read_i32().await?;
                    for _ in 0..size {
                        self.skip(etype).await?;
                    }
                }
                other => {
                    return Err(Error::QueryFailed(format!(
                        "cannot skip unknown thrift type {other}"
                    )));
                }
            }
            Ok(())
        })
    }

    fn check_status(status: TStatus) -> Result<()> {
        if status.code == STATUS_SUCCESS || status.code == STATUS_SUCCESS_WITH_INFO {
            return Ok(());
        }
        Err(Error::QueryFailed(
            status
                .error_message
                .unwrap_or_else(|| format!("hive status code {}", status.code)),
        ))
    }
}

fn write_message_begin(buf: &mut Vec<u8>, name: &str, message_type: u8, seq: i32) {
    buf.put_u32(VERSION_1 | message_type as u32);
    write_string(buf, name);
    buf.put_i32(seq);
}

fn write_field_begin(buf: &mut Vec<u8>, ttype: u8, id: i16) {
    buf.put_u8(ttype);
    buf.put_i16(id);
}

fn write_stop(buf: &mut Vec<u8>) {
    buf.put_u8(T_STOP);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value);
}

fn write_session_handle(buf: &mut Vec<u8>, session: &SessionHandle) {
    // field 1: THandleIdentifier
    write_field_begin(buf, T_STRUCT, 1);
    write_field_begin(buf, T_STRING, 1);
    write_bytes(buf, &session.guid);
    write_field_begin(buf, T_STRING, 2);
    write_bytes(buf, &session.secret);
    write_stop(buf);
    write_stop(buf);
}

#[async_trait]
impl HiveConnection for ThriftHiveConnection {
    async fn execute(&mut self, query: &str) -> Result<()> {
        let seq = self.next_seq();
        let mut buf = Vec::new();
        write_message_begin(&mut buf, "ExecuteStatement", MSG_CALL, seq);
        // args struct, field 1: TExecuteStatementReq
        write_field_begin(&mut buf, T_STRUCT, 1);
        {
            // field 1: sessionHandle
            write_field_begin(&mut buf, T_STRUCT, 1);
            write_session_handle(&mut buf, &self.session);
            // field 2: statement
            write_field_begin(&mut buf, T_STRING, 2);
            write_string(&mut buf, query);
            write_stop(&mut buf);
        }
        write_stop(&mut buf);
        self.send(&buf).await?;

        self.read_reply_header("ExecuteStatement").await?;
        let mut status = TStatus::default();
        // reply struct
        loop {
            let (ttype, id) = self.read_field_header().await?;
            match (ttype, id) {
                (T_STOP, _) => break,
                // field 0: TExecuteStatementResp
                (T_STRUCT, 0) => loop {
                    let (rtype, rid) = self.read_field_header().await?;
                    match (rtype, rid) {
                        (T_STOP, _) => break,
                        (T_STRUCT, 1) => status = self.read_t_status().await?,
                        _ => self.skip(rtype).await?,
                    }
                },
                _ => self.skip(ttype).await?,
            }
        }
        Self::check_status(status)
    }

    async fn close(&mut self) {
        let seq = self.next_seq();
        let mut buf = Vec::new();
        write_message_begin(&mut buf, "CloseSession", MSG_CALL, seq);
        write_field_begin(&mut buf, T_STRUCT, 1);
        {
            write_field_begin(&mut buf, T_STRUCT, 1);
            write_session_handle(&mut buf, &self.session);
            write_stop(&mut buf);
        }
        write_stop(&mut buf);
        // Best effort: the session dies with the socket either way.
        if self.send(&buf).await.is_ok() {
            let _ = self.read_reply_header("CloseSession").await;
            let _ = self.skip(T_STRUCT).await;
        }
        let _ = self.stream.get_mut().shutdown().await;
    }
}
