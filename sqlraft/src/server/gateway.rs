//! The gateway: per-connection owner of databases and prepared statements.
//!
//! The gateway translates typed requests into SQL engine calls for one client session. Each
//! in-flight request occupies a slot in a small context ring which owns the response's wire
//! buffer: the response stays valid from `handle` until the connection calls `finish`.

use std::sync::Arc;
use std::time::Instant;

use crate::server::error::Error;
use crate::server::message::Message;
use crate::server::registry::Registry;
use crate::server::schema::Request;
use crate::server::schema::Response;
use crate::server::sql::Cluster;
use crate::server::sql::ClusterError;
use crate::server::sql::EngineError;
use crate::server::sql::SqlConnection;
use crate::server::sql::SqlEngine;
use crate::server::sql::SqlStatement;
use crate::server::sql::SqlValue;

/// The number of concurrent request contexts per gateway.
pub const MAX_REQUESTS: usize = 5;

/// An open database and its prepared statements.
struct Db<C: SqlConnection> {
    conn: C,
    stmts: Registry<C::Statement>,
}

/// One in-flight request context, owning the response buffer.
struct RequestCtx {
    response: Message,
}

/// The per-connection request dispatcher.
pub struct Gateway<E: SqlEngine, C: Cluster> {
    engine: Arc<E>,
    cluster: Arc<C>,
    /// The heartbeat timeout advertised to the client, in milliseconds.
    heartbeat_timeout: u64,
    /// The registered client id, 0 until a client request arrives.
    client_id: u64,
    /// When the client last sent a heartbeat or registered.
    heartbeat: Option<Instant>,
    dbs: Registry<Db<E::Connection>>,
    ctxs: Vec<Option<RequestCtx>>,
}

impl<E: SqlEngine, C: Cluster> Gateway<E, C> {
    pub fn new(engine: Arc<E>, cluster: Arc<C>, heartbeat_timeout: u64) -> Self {
        let mut ctxs = Vec::with_capacity(MAX_REQUESTS);
        ctxs.resize_with(MAX_REQUESTS, || None);
        Self {
            engine,
            cluster,
            heartbeat_timeout,
            client_id: 0,
            heartbeat: None,
            dbs: Registry::new(),
            ctxs,
        }
    }

    /// The registered client id, if any.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// When the client last registered or heartbeated.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.heartbeat
    }

    /// Handle a decoded request, returning the context slot holding the encoded response.
    ///
    /// The response buffer stays valid until [`Gateway::finish`] is called with the returned
    /// slot. Exhausting the context ring is a protocol violation and aborts the connection.
    #[tracing::instrument(level = "debug", skip(self, request), fields(request=%request.type_name()))]
    pub async fn handle(&mut self, request: Request) -> Result<usize, Error> {
        let slot = self
            .ctxs
            .iter()
            .position(|c| c.is_none())
            .ok_or_else(|| Error::Protocol("concurrent request limit exceeded".into()))?;

        let response = self.dispatch(request).await?;

        let mut ctx = RequestCtx {
            response: Message::new(),
        };
        response.encode(&mut ctx.response)?;
        self.ctxs[slot] = Some(ctx);
        Ok(slot)
    }

    /// Access the encoded response owned by the given context slot.
    pub fn response(&mut self, slot: usize) -> Option<&mut Message> {
        self.ctxs.get_mut(slot).and_then(|c| c.as_mut()).map(|c| &mut c.response)
    }

    /// Release the given context slot; its response buffer is no longer valid.
    pub fn finish(&mut self, slot: usize) {
        if let Some(ctx) = self.ctxs.get_mut(slot) {
            *ctx = None;
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response, Error> {
        match request {
            Request::Leader => self.leader().await,
            Request::Client { id } => self.client(id),
            Request::Heartbeat { timestamp } => self.heartbeat(timestamp).await,
            Request::Open { name, flags, vfs } => self.open(&name, flags, &vfs),
            Request::Prepare { db_id, sql } => self.prepare(db_id, &sql),
            Request::Exec { db_id, stmt_id, params } => self.exec(db_id, stmt_id, &params),
            Request::Query { db_id, stmt_id, params } => self.query(db_id, stmt_id, &params),
            Request::Finalize { db_id, stmt_id } => self.finalize(db_id, stmt_id),
            Request::ExecSql { db_id, sql, params } => self.exec_sql(db_id, &sql, &params),
            Request::QuerySql { db_id, sql, params } => self.query_sql(db_id, &sql, &params),
        }
    }

    async fn leader(&mut self) -> Result<Response, Error> {
        let address = match self.cluster.leader().await {
            Some((_id, address)) => address,
            None => String::new(),
        };
        Ok(Response::Server { address })
    }

    fn client(&mut self, id: u64) -> Result<Response, Error> {
        self.client_id = id;
        self.heartbeat = Some(Instant::now());
        Ok(Response::Welcome {
            heartbeat_timeout: self.heartbeat_timeout,
        })
    }

    async fn heartbeat(&mut self, _timestamp: u64) -> Result<Response, Error> {
        let addresses = match self.cluster.servers().await {
            Ok(addresses) => addresses,
            Err(ClusterError::NotLeader(_)) => {
                return Err(Error::Busy("this node is not the cluster leader".into()));
            }
            Err(ClusterError::Unavailable(msg)) => return Err(Error::Busy(msg)),
        };
        self.heartbeat = Some(Instant::now());
        Ok(Response::Servers { addresses })
    }

    fn open(&mut self, name: &str, flags: u64, vfs: &str) -> Result<Response, Error> {
        let conn = self.engine.open(name, flags, vfs).map_err(engine_error)?;
        let id = self.dbs.add(Db {
            conn,
            stmts: Registry::new(),
        });
        Ok(Response::Db { id: id as u32 })
    }

    fn prepare(&mut self, db_id: u32, sql: &str) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        let stmt = db.conn.prepare(sql).map_err(engine_error)?;
        let id = db.stmts.add(stmt);
        Ok(Response::Stmt {
            db_id,
            id: id as u32,
        })
    }

    fn exec(&mut self, db_id: u32, stmt_id: u32, params: &[SqlValue]) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        let stmt = lookup_stmt(db, stmt_id)?;
        let result = stmt.exec(params).map_err(engine_error)?;
        Ok(Response::Result {
            last_insert_id: result.last_insert_id,
            rows_affected: result.rows_affected,
        })
    }

    fn query(&mut self, db_id: u32, stmt_id: u32, params: &[SqlValue]) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        let stmt = lookup_stmt(db, stmt_id)?;
        let rows = stmt.query(params).map_err(engine_error)?;
        Ok(Response::Rows {
            columns: rows.columns,
            rows: rows.rows,
        })
    }

    fn finalize(&mut self, db_id: u32, stmt_id: u32) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        db.stmts
            .del(stmt_id as usize)
            .ok_or_else(|| Error::NotFound(format!("no stmt with id {}", stmt_id)))?;
        Ok(Response::Empty)
    }

    fn exec_sql(&mut self, db_id: u32, sql: &str, params: &[SqlValue]) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        let mut stmt = db.conn.prepare(sql).map_err(engine_error)?;
        let result = stmt.exec(params).map_err(engine_error)?;
        Ok(Response::Result {
            last_insert_id: result.last_insert_id,
            rows_affected: result.rows_affected,
        })
    }

    fn query_sql(&mut self, db_id: u32, sql: &str, params: &[SqlValue]) -> Result<Response, Error> {
        let db = lookup_db(&mut self.dbs, db_id)?;
        let mut stmt = db.conn.prepare(sql).map_err(engine_error)?;
        let rows = stmt.query(params).map_err(engine_error)?;
        Ok(Response::Rows {
            columns: rows.columns,
            rows: rows.rows,
        })
    }
}

fn lookup_db<C: SqlConnection>(dbs: &mut Registry<Db<C>>, db_id: u32) -> Result<&mut Db<C>, Error> {
    dbs.get_mut(db_id as usize)
        .ok_or_else(|| Error::NotFound(format!("no db with id {}", db_id)))
}

fn lookup_stmt<C: SqlConnection>(db: &mut Db<C>, stmt_id: u32) -> Result<&mut C::Statement, Error> {
    db.stmts
        .get_mut(stmt_id as usize)
        .ok_or_else(|| Error::NotFound(format!("no stmt with id {}", stmt_id)))
}

fn engine_error(err: EngineError) -> Error {
    Error::Engine {
        code: err.code,
        extended: err.extended,
        message: err.message,
    }
}
