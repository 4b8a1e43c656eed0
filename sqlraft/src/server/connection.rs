//! The per-socket connection state machine.
//!
//! A connection turns the byte stream into discrete request frames and writes back one
//! response per request. The cursor moves through four phases: handshake (protocol version),
//! preamble (awaiting the next frame), header (validating the frame header) and body
//! (receiving and dispatching the request). Reads are paused while a response write is in
//! flight, so a session never has more than one request outstanding.

use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::server::error::Error;
use crate::server::gateway::Gateway;
use crate::server::message::Message;
use crate::server::message::HEADER_LEN;
use crate::server::schema::Request;
use crate::server::schema::Response;
use crate::server::sql::Cluster;
use crate::server::sql::SqlEngine;

/// The connection FSM cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Awaiting the 8-byte protocol version.
    Handshake,
    /// Awaiting the first byte of the next frame.
    Preamble,
    /// Frame header received, being validated.
    Header,
    /// Receiving and dispatching the frame body.
    Body,
}

/// A client connection being served.
pub struct Connection<IO, E: SqlEngine, C: Cluster> {
    stream: IO,
    gateway: Gateway<E, C>,
    /// The protocol version this server speaks.
    protocol_version: u64,
    /// The message-in-progress buffer pair: inline body plus heap overflow.
    request: Message,
    phase: Phase,
    aborted: bool,
    /// Connections with no complete request within this window are aborted.
    heartbeat_timeout: Duration,
    last_request: Instant,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<IO, E, C> Connection<IO, E, C>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    E: SqlEngine,
    C: Cluster,
{
    pub fn new(stream: IO, gateway: Gateway<E, C>, protocol_version: u64, heartbeat_timeout: Duration) -> Self {
        Self {
            stream,
            gateway,
            protocol_version,
            request: Message::new(),
            phase: Phase::Handshake,
            aborted: false,
            heartbeat_timeout,
            last_request: Instant::now(),
            shutdown: None,
        }
    }

    /// Attach a shutdown signal; the connection aborts when it fires.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Serve the connection until the peer disconnects, a fatal error occurs, or shutdown.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => {
                tracing::debug!("connection closed by peer");
                let _ = self.stream.shutdown().await;
            }
            Err(err) => self.abort(err).await,
        }
    }

    async fn serve(&mut self) -> Result<(), Error> {
        // Handshake: the first 8 bytes carry the little-endian protocol version; anything
        // else is rejected by closing the socket without a reply.
        debug_assert_eq!(self.phase, Phase::Handshake);
        let mut handshake = [0u8; 8];
        self.read_exact_timed(&mut handshake).await?;
        let version = u64::from_le_bytes(handshake);
        if version != self.protocol_version {
            return Err(Error::Protocol(format!(
                "unknown protocol version {:#x}",
                version
            )));
        }
        self.phase = Phase::Preamble;

        loop {
            // Preamble: await the fixed-size frame header of the next request. A quiet peer
            // is cut off once the heartbeat window closes.
            debug_assert_eq!(self.phase, Phase::Preamble);
            let mut header = [0u8; HEADER_LEN];
            match self.read_exact_timed(&mut header).await {
                Ok(()) => {}
                Err(Error::Io(ref err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Clean EOF between frames.
                    return Ok(());
                }
                Err(err) => return Err(err),
            }

            // Header: validate the word count and allocate the body buffer.
            self.phase = Phase::Header;
            self.request.reset();
            self.request.header_recv(&header)?;

            // Body: receive, decode, dispatch, respond.
            self.phase = Phase::Body;
            let body = self.request.body_recv_start();
            self.stream.read_exact(body).await?;
            self.last_request = Instant::now();

            match Request::decode(&mut self.request) {
                Ok(request) => self.dispatch(request).await?,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    // Valid framing, bad contents: fail this request only.
                    tracing::debug!(error=%err, "failed to parse request body");
                    self.write_failure(&err).await?;
                }
            }

            self.phase = Phase::Preamble;
        }
    }

    /// Hand the request to the gateway and write its response, or a synthesized failure.
    async fn dispatch(&mut self, request: Request) -> Result<(), Error> {
        match self.gateway.handle(request).await {
            Ok(slot) => {
                let result = self.write_response(slot).await;
                // The write completion releases the context slot, aborted or not.
                self.gateway.finish(slot);
                result
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::debug!(error=%err, "request failed");
                self.write_failure(&err).await
            }
        }
    }

    async fn write_response(&mut self, slot: usize) -> Result<(), Error> {
        if self.aborted {
            return Ok(());
        }
        let message = match self.gateway.response(slot) {
            Some(message) => message,
            None => return Ok(()),
        };
        let header = message.send_start()?;
        let body = message.body().to_vec();
        self.stream.write_all(&header).await?;
        self.stream.write_all(&body).await?;
        Ok(())
    }

    async fn write_failure(&mut self, err: &Error) -> Result<(), Error> {
        if self.aborted {
            return Ok(());
        }
        let response = Response::Failure {
            code: err.code(),
            description: err.to_string(),
        };
        let mut message = Message::new();
        response.encode(&mut message)?;
        let header = message.send_start()?;
        self.stream.write_all(&header).await?;
        self.stream.write_all(message.body()).await?;
        Ok(())
    }

    /// Read exactly `buf` bytes, enforcing the heartbeat window and honoring the shutdown
    /// signal.
    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let shutdown = self.shutdown.clone();
        let window = self.heartbeat_timeout;
        let since_last = self.last_request.elapsed();

        let stream = &mut self.stream;
        let read = async move {
            match timeout(window, stream.read_exact(buf)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(Error::Io(err)),
                Err(_) => Err(Error::Protocol(format!("no heartbeat since {:?}", since_last))),
            }
        };

        match shutdown {
            None => read.await,
            Some(mut shutdown) => {
                tokio::select! {
                    res = read => res,
                    _ = shutdown.changed() => Err(Error::Protocol("server is shutting down".into())),
                }
            }
        }
    }

    /// Abort the connection: release the receive buffer and close the socket.
    ///
    /// Idempotent. A clean disconnect is logged at debug level, anything else at error.
    async fn abort(&mut self, err: Error) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.request.reset();

        if is_clean_disconnect(&err) {
            tracing::debug!(error=%err, "connection aborted");
        } else {
            tracing::error!(error=%err, "connection aborted");
        }

        let _ = self.stream.shutdown().await;
    }
}

fn is_clean_disconnect(err: &Error) -> bool {
    match err {
        Error::Io(err) => matches!(
            err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
