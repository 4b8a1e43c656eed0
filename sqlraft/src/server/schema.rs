//! Typed request and response schemas.
//!
//! Each wire message type maps to one variant; encoding and decoding go through the field
//! codecs of [`Message`]. An unknown type code is a protocol error.

use crate::server::error::Error;
use crate::server::message::Message;
use crate::server::message::WORD_SIZE;
use crate::server::sql::SqlValue;

/// Request type codes.
pub mod request_type {
    pub const LEADER: u8 = 0;
    pub const CLIENT: u8 = 1;
    pub const HEARTBEAT: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const PREPARE: u8 = 4;
    pub const EXEC: u8 = 5;
    pub const QUERY: u8 = 6;
    pub const FINALIZE: u8 = 7;
    pub const EXEC_SQL: u8 = 8;
    pub const QUERY_SQL: u8 = 9;
}

/// Response type codes.
pub mod response_type {
    pub const FAILURE: u8 = 0;
    pub const SERVER: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const SERVERS: u8 = 3;
    pub const DB: u8 = 4;
    pub const STMT: u8 = 5;
    pub const RESULT: u8 = 6;
    pub const ROWS: u8 = 7;
    pub const EMPTY: u8 = 8;
}

/// A decoded client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Ask for the address of the cluster leader.
    Leader,
    /// Register the client id and negotiate the heartbeat timeout.
    Client { id: u64 },
    /// Keep the connection alive and fetch the current server addresses.
    Heartbeat { timestamp: u64 },
    /// Open a database.
    Open { name: String, flags: u64, vfs: String },
    /// Compile SQL into a prepared statement.
    Prepare { db_id: u32, sql: String },
    /// Execute a prepared statement to completion.
    Exec {
        db_id: u32,
        stmt_id: u32,
        params: Vec<SqlValue>,
    },
    /// Execute a prepared statement and stream its rows.
    Query {
        db_id: u32,
        stmt_id: u32,
        params: Vec<SqlValue>,
    },
    /// Release a prepared statement.
    Finalize { db_id: u32, stmt_id: u32 },
    /// Compile and execute SQL in one round trip.
    ExecSql {
        db_id: u32,
        sql: String,
        params: Vec<SqlValue>,
    },
    /// Compile and query SQL in one round trip.
    QuerySql {
        db_id: u32,
        sql: String,
        params: Vec<SqlValue>,
    },
}

impl Request {
    /// The wire type code of this request.
    pub fn type_code(&self) -> u8 {
        use request_type::*;
        match self {
            Request::Leader => LEADER,
            Request::Client { .. } => CLIENT,
            Request::Heartbeat { .. } => HEARTBEAT,
            Request::Open { .. } => OPEN,
            Request::Prepare { .. } => PREPARE,
            Request::Exec { .. } => EXEC,
            Request::Query { .. } => QUERY,
            Request::Finalize { .. } => FINALIZE,
            Request::ExecSql { .. } => EXEC_SQL,
            Request::QuerySql { .. } => QUERY_SQL,
        }
    }

    /// A short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Leader => "leader",
            Request::Client { .. } => "client",
            Request::Heartbeat { .. } => "heartbeat",
            Request::Open { .. } => "open",
            Request::Prepare { .. } => "prepare",
            Request::Exec { .. } => "exec",
            Request::Query { .. } => "query",
            Request::Finalize { .. } => "finalize",
            Request::ExecSql { .. } => "exec_sql",
            Request::QuerySql { .. } => "query_sql",
        }
    }

    /// Decode the body of the given message according to its header type.
    pub fn decode(m: &mut Message) -> Result<Self, Error> {
        use request_type::*;
        let req = match m.mtype() {
            LEADER => {
                let _unused = m.get_u64()?;
                Request::Leader
            }
            CLIENT => Request::Client { id: m.get_u64()? },
            HEARTBEAT => Request::Heartbeat { timestamp: m.get_u64()? },
            OPEN => Request::Open {
                name: m.get_text()?,
                flags: m.get_u64()?,
                vfs: m.get_text()?,
            },
            PREPARE => Request::Prepare {
                db_id: m.get_u32()?,
                sql: m.get_text()?,
            },
            EXEC => Request::Exec {
                db_id: m.get_u32()?,
                stmt_id: m.get_u32()?,
                params: decode_params(m)?,
            },
            QUERY => Request::Query {
                db_id: m.get_u32()?,
                stmt_id: m.get_u32()?,
                params: decode_params(m)?,
            },
            FINALIZE => Request::Finalize {
                db_id: m.get_u32()?,
                stmt_id: m.get_u32()?,
            },
            EXEC_SQL => Request::ExecSql {
                db_id: m.get_u32()?,
                sql: m.get_text()?,
                params: decode_params(m)?,
            },
            QUERY_SQL => Request::QuerySql {
                db_id: m.get_u32()?,
                sql: m.get_text()?,
                params: decode_params(m)?,
            },
            other => return Err(Error::Protocol(format!("unknown request type {}", other))),
        };
        Ok(req)
    }

    /// Encode this request into the given message.
    pub fn encode(&self, m: &mut Message) -> Result<(), Error> {
        m.reset();
        m.header_put(self.type_code(), 0);
        match self {
            Request::Leader => {
                // The body may not be empty; a leader request carries one unused word.
                m.put_u64(0)?;
            }
            Request::Client { id } => m.put_u64(*id)?,
            Request::Heartbeat { timestamp } => m.put_u64(*timestamp)?,
            Request::Open { name, flags, vfs } => {
                m.put_text(name)?;
                m.put_u64(*flags)?;
                m.put_text(vfs)?;
            }
            Request::Prepare { db_id, sql } => {
                m.put_u32(*db_id)?;
                m.put_text(sql)?;
            }
            Request::Exec { db_id, stmt_id, params } | Request::Query { db_id, stmt_id, params } => {
                m.put_u32(*db_id)?;
                m.put_u32(*stmt_id)?;
                encode_params(m, params)?;
            }
            Request::Finalize { db_id, stmt_id } => {
                m.put_u32(*db_id)?;
                m.put_u32(*stmt_id)?;
            }
            Request::ExecSql { db_id, sql, params } | Request::QuerySql { db_id, sql, params } => {
                m.put_u32(*db_id)?;
                m.put_text(sql)?;
                encode_params(m, params)?;
            }
        }
        Ok(())
    }
}

/// A server response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The request failed; `code` plus a human readable description.
    Failure { code: u64, description: String },
    /// The address of the cluster leader.
    Server { address: String },
    /// Handshake result carrying the negotiated heartbeat timeout in milliseconds.
    Welcome { heartbeat_timeout: u64 },
    /// The addresses of all cluster members.
    Servers { addresses: Vec<String> },
    /// A database handle.
    Db { id: u32 },
    /// A prepared statement handle.
    Stmt { db_id: u32, id: u32 },
    /// The outcome of executing a statement.
    Result { last_insert_id: u64, rows_affected: u64 },
    /// The rows produced by a query.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// Success with nothing to report.
    Empty,
}

impl Response {
    /// The wire type code of this response.
    pub fn type_code(&self) -> u8 {
        use response_type::*;
        match self {
            Response::Failure { .. } => FAILURE,
            Response::Server { .. } => SERVER,
            Response::Welcome { .. } => WELCOME,
            Response::Servers { .. } => SERVERS,
            Response::Db { .. } => DB,
            Response::Stmt { .. } => STMT,
            Response::Result { .. } => RESULT,
            Response::Rows { .. } => ROWS,
            Response::Empty => EMPTY,
        }
    }

    /// Encode this response into the given message.
    pub fn encode(&self, m: &mut Message) -> Result<(), Error> {
        m.reset();
        m.header_put(self.type_code(), 0);
        match self {
            Response::Failure { code, description } => {
                m.put_u64(*code)?;
                m.put_text(description)?;
            }
            Response::Server { address } => m.put_text(address)?,
            Response::Welcome { heartbeat_timeout } => m.put_u64(*heartbeat_timeout)?,
            Response::Servers { addresses } => m.put_text_list(addresses)?,
            Response::Db { id } => {
                m.put_u32(*id)?;
                m.put_u32(0)?; // reserved
            }
            Response::Stmt { db_id, id } => {
                m.put_u32(*db_id)?;
                m.put_u32(*id)?;
            }
            Response::Result {
                last_insert_id,
                rows_affected,
            } => {
                m.put_u64(*last_insert_id)?;
                m.put_u64(*rows_affected)?;
            }
            Response::Rows { columns, rows } => {
                m.put_u64(columns.len() as u64)?;
                for column in columns {
                    m.put_text(column)?;
                }
                for row in rows {
                    encode_row(m, columns.len(), row)?;
                }
            }
            Response::Empty => {
                m.put_u64(0)?;
            }
        }
        Ok(())
    }

    /// Decode the body of the given message according to its header type.
    pub fn decode(m: &mut Message) -> Result<Self, Error> {
        use response_type::*;
        let res = match m.mtype() {
            FAILURE => Response::Failure {
                code: m.get_u64()?,
                description: m.get_text()?,
            },
            SERVER => Response::Server { address: m.get_text()? },
            WELCOME => Response::Welcome {
                heartbeat_timeout: m.get_u64()?,
            },
            SERVERS => Response::Servers {
                addresses: m.get_text_list()?,
            },
            DB => {
                let id = m.get_u32()?;
                let _reserved = m.get_u32()?;
                Response::Db { id }
            }
            STMT => Response::Stmt {
                db_id: m.get_u32()?,
                id: m.get_u32()?,
            },
            RESULT => Response::Result {
                last_insert_id: m.get_u64()?,
                rows_affected: m.get_u64()?,
            },
            ROWS => {
                let n_columns = m.get_u64()? as usize;
                let mut columns = Vec::with_capacity(n_columns);
                for _ in 0..n_columns {
                    columns.push(m.get_text()?);
                }
                let mut rows = Vec::new();
                while m.remaining() > 0 {
                    rows.push(decode_row(m, n_columns)?);
                }
                Response::Rows { columns, rows }
            }
            EMPTY => {
                let _unused = m.get_u64()?;
                Response::Empty
            }
            other => return Err(Error::Protocol(format!("unknown response type {}", other))),
        };
        Ok(res)
    }
}

/// Encode a statement parameter tuple: a count byte, one type byte per parameter, padding to
/// the next word boundary, then the values.
fn encode_params(m: &mut Message, params: &[SqlValue]) -> Result<(), Error> {
    if params.len() > u8::MAX as usize {
        return Err(Error::Protocol("too many statement parameters".into()));
    }
    m.put_u8(params.len() as u8)?;
    for param in params {
        m.put_u8(param.type_code())?;
    }
    m.pad_word()?;
    for param in params {
        encode_value(m, param)?;
    }
    Ok(())
}

/// Decode a statement parameter tuple.
fn decode_params(m: &mut Message) -> Result<Vec<SqlValue>, Error> {
    let n = m.get_u8()? as usize;
    let mut types = Vec::with_capacity(n);
    for _ in 0..n {
        types.push(m.get_u8()?);
    }
    m.align_word();
    let mut params = Vec::with_capacity(n);
    for t in types {
        params.push(decode_value(m, t)?);
    }
    Ok(params)
}

/// Encode a result row: per-column type tags packed 4 bits each, padded to a word boundary,
/// followed by the column values.
fn encode_row(m: &mut Message, n_columns: usize, row: &[SqlValue]) -> Result<(), Error> {
    if row.len() != n_columns {
        return Err(Error::Protocol("row width does not match column count".into()));
    }
    let header_len = (n_columns * 4 + 63) / 64 * WORD_SIZE;
    let mut header = vec![0u8; header_len];
    for (i, value) in row.iter().enumerate() {
        let tag = value.type_code() & 0x0f;
        let byte = i / 2;
        if i % 2 == 0 {
            header[byte] |= tag;
        } else {
            header[byte] |= tag << 4;
        }
    }
    for byte in header {
        m.put_u8(byte)?;
    }
    for value in row {
        encode_value(m, value)?;
    }
    Ok(())
}

/// Decode a result row.
fn decode_row(m: &mut Message, n_columns: usize) -> Result<Vec<SqlValue>, Error> {
    let header_len = (n_columns * 4 + 63) / 64 * WORD_SIZE;
    let mut header = vec![0u8; header_len];
    for byte in header.iter_mut() {
        *byte = m.get_u8()?;
    }
    let mut row = Vec::with_capacity(n_columns);
    for i in 0..n_columns {
        let byte = header[i / 2];
        let tag = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        row.push(decode_value(m, tag)?);
    }
    Ok(row)
}

fn encode_value(m: &mut Message, value: &SqlValue) -> Result<(), Error> {
    match value {
        SqlValue::Integer(v) => m.put_i64(*v),
        SqlValue::Float(v) => m.put_f64(*v),
        SqlValue::Text(v) => m.put_text(v),
        SqlValue::Blob(v) => m.put_blob(v),
        SqlValue::Null => m.put_u64(0),
    }
}

fn decode_value(m: &mut Message, type_code: u8) -> Result<SqlValue, Error> {
    let value = match type_code {
        1 => SqlValue::Integer(m.get_i64()?),
        2 => SqlValue::Float(m.get_f64()?),
        3 => SqlValue::Text(m.get_text()?),
        4 => SqlValue::Blob(m.get_blob()?),
        5 => {
            let _unused = m.get_u64()?;
            SqlValue::Null
        }
        other => return Err(Error::Parse(format!("unknown value type tag {}", other))),
    };
    Ok(value)
}
