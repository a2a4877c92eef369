//! TLS record layer as a pipeline stage.
//!
//! Wraps a sans-IO `rustls::Connection`: ciphertext moves between this
//! stage and the transport side of the pipeline, plaintext between this
//! stage and the application side. The handshake is driven entirely by
//! the reads the pipeline feeds in; there is no socket here.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::error::{Error, Result};
use crate::pipeline::{Stage, StageContext};
use crate::prelude::{debug, error, trace};

/// A negotiated TLS session in the pipeline.
pub struct TlsStage {
    conn: Connection,
}

impl std::fmt::Debug for TlsStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStage")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsStage {
    /// A client session. `server_name` is the SNI / certificate name to
    /// verify, typically the connection's authority.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::HandshakeFailed(format!("invalid server name: {e}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        Ok(Self {
            conn: Connection::Client(conn),
        })
    }

    /// A server session.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        Ok(Self {
            conn: Connection::Server(conn),
        })
    }

    // Pushes any pending ciphertext (handshake records, alerts,
    // encrypted application data) towards the transport.
    fn flush_tls(&mut self, ctx: &mut StageContext<'_>) {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            if let Err(e) = self.conn.write_tls(&mut out) {
                ctx.forward_error(Error::HandshakeFailed(format!("emitting records: {e}")));
                return;
            }
        }
        if !out.is_empty() {
            trace!("tls stage emitting {} ciphertext byte(s)", out.len());
            ctx.forward_write(Bytes::from(out));
        }
    }

    fn drain_plaintext(&mut self, ctx: &mut StageContext<'_>) {
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => {
                    debug!("tls peer closed the session");
                    ctx.forward_read_complete();
                    return;
                }
                Ok(n) => ctx.forward_read(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    ctx.forward_error(Error::HandshakeFailed(format!("reading plaintext: {e}")));
                    return;
                }
            }
        }
    }
}

impl Stage for TlsStage {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        // A client wants to send its Hello before any bytes arrive.
        self.flush_tls(ctx);
    }

    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        let mut input = data.as_ref();
        while !input.is_empty() {
            match self.conn.read_tls(&mut input) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    ctx.forward_error(Error::HandshakeFailed(format!("ingesting records: {e}")));
                    return;
                }
            }
        }

        if let Err(e) = self.conn.process_new_packets() {
            error!("tls session failed: {e}");
            // Flush so the close alert rustls queued reaches the peer.
            self.flush_tls(ctx);
            ctx.forward_error(Error::HandshakeFailed(e.to_string()));
            return;
        }

        self.drain_plaintext(ctx);
        self.flush_tls(ctx);
    }

    fn on_read_complete(&mut self, ctx: &mut StageContext<'_>) {
        self.conn.send_close_notify();
        self.flush_tls(ctx);
        ctx.forward_read_complete();
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        // Buffered by rustls until the handshake allows sending.
        if let Err(e) = self.conn.writer().write_all(&data) {
            ctx.forward_error(Error::HandshakeFailed(format!("queueing plaintext: {e}")));
            return;
        }
        self.flush_tls(ctx);
    }
}
