use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicU64, Ordering},
};

use futures::future::join_all;
use quinn::VarInt;
use tracing::{debug, debug_span, trace, Instrument};

use super::{tls, Error, MAX_REPLY_BYTES};
use crate::engine::{
    ast::AstNode,
    wire::{
        decode_reply, decode_stored_results, encode_command, encode_deletion_list,
        encode_operation, encode_out_of_band, CommandKind, Creation, Initializer, Reader,
        ReplyBody, StoredResult,
    },
    ClientId, Epoch, Name,
};

/// A connected session with the array server.
///
/// Epochs and names are handed out atomically, so requests can be issued
/// from several tasks at once. The server executes them in the order their
/// epochs were allocated, not the order they arrive in.
pub struct Client {
    endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    id: ClientId,
    next_epoch: AtomicU64,
    next_name: AtomicU64,
}

impl Client {
    /// Connects to `addr`, trusting only `trusted_cert_der`, and registers
    /// with the server to obtain a client id.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        trusted_cert_der: &[u8],
    ) -> Result<Self, Error> {
        let bind = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(tls::client_config(trusted_cert_der)?);

        let span = debug_span!("client", remote = %addr);
        async move {
            let conn = endpoint.connect(addr, server_name)?.await?;
            debug!("connected via QUIC");
            let reply = round_trip(&conn, &encode_out_of_band(CommandKind::Connect)).await?;
            let mut body = ok_body(&reply)?;
            let id = body.u8("client id")?;
            body.finish()?;
            debug!(id, "registered");
            Ok::<_, Error>(Self {
                endpoint,
                conn,
                id,
                next_epoch: AtomicU64::new(0),
                next_name: AtomicU64::new(0),
            })
        }
        .instrument(span)
        .await
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// A fresh name, unique across clients as long as each one stays below
    /// 2^56 allocations.
    pub fn next_name(&self) -> Name {
        let counter = self.next_name.fetch_add(1, Ordering::Relaxed);
        Name(((self.id as u64) << 56) | counter)
    }

    fn next_epoch(&self) -> Epoch {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    /// Encodes a sequenced command and claims the next epoch for it. The
    /// epoch is spent even if the frame is never sent, which leaves every
    /// later command of this client stuck on the server.
    pub fn prepare(&self, kind: CommandKind, payload: &[u8]) -> Vec<u8> {
        encode_command(kind, self.id, self.next_epoch(), payload)
    }

    /// Sends a pre-encoded frame and returns the raw reply, which is empty
    /// when the server had nothing to say.
    pub async fn send_raw(&self, frame: &[u8]) -> Result<Vec<u8>, Error> {
        round_trip(&self.conn, frame).await
    }

    /// Sends every frame on its own stream at the same time. Replies come
    /// back in the order of `frames`.
    pub async fn send_all(&self, frames: &[Vec<u8>]) -> Vec<Result<Vec<u8>, Error>> {
        join_all(frames.iter().map(|frame| self.send_raw(frame))).await
    }

    async fn command(&self, kind: CommandKind, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let frame = self.prepare(kind, payload);
        self.send_raw(&frame).await
    }

    /// Creates an array under a fresh name.
    pub async fn create(&self, dims: &[u64], init: Initializer) -> Result<Name, Error> {
        let name = self.next_name();
        let creation = Creation {
            name,
            dims: dims.to_vec(),
            init,
        };
        let reply = self.command(CommandKind::Creation, &creation.encode()).await?;
        expect_flag(&reply)?;
        Ok(name)
    }

    pub async fn vector(&self, values: Vec<f64>) -> Result<Name, Error> {
        let len = values.len() as u64;
        self.create(&[len], Initializer::Buffer(values)).await
    }

    /// A row-major `rows x cols` matrix.
    pub async fn matrix(&self, rows: u64, cols: u64, values: Vec<f64>) -> Result<Name, Error> {
        self.create(&[rows, cols], Initializer::Buffer(values)).await
    }

    /// Deletes `deletions`, then evaluates `tree`. Returns what the tree
    /// stored.
    pub async fn evaluate(
        &self,
        deletions: &[Name],
        tree: &AstNode,
    ) -> Result<Vec<StoredResult>, Error> {
        let reply = self
            .command(CommandKind::Operation, &encode_operation(deletions, tree))
            .await?;
        let mut body = ok_body(&reply)?;
        let results = decode_stored_results(&mut body)?;
        body.finish()?;
        Ok(results)
    }

    pub async fn delete(&self, names: &[Name]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(4 + 8 * names.len());
        encode_deletion_list(names, &mut payload);
        let reply = self.command(CommandKind::Deletion, &payload).await?;
        ok_body(&reply)?.finish()?;
        Ok(())
    }

    /// Value of a scalar.
    pub async fn fetch(&self, name: Name) -> Result<f64, Error> {
        let reply = self.command(CommandKind::Fetch, &name.0.to_le_bytes()).await?;
        decode_value(&reply)
    }

    /// Resolves once every command issued before it has executed.
    pub async fn sync(&self) -> Result<(), Error> {
        let reply = self.command(CommandKind::Sync, &[]).await?;
        expect_flag(&reply)
    }

    /// Asks the server to stop. Only honored if the server allows it.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let reply = self.send_raw(&encode_out_of_band(CommandKind::Shutdown)).await?;
        ok_body(&reply)?.finish()?;
        Ok(())
    }

    /// Releases the client id and closes the connection.
    pub async fn disconnect(self) -> Result<(), Error> {
        let reply = self.command(CommandKind::Disconnect, &[self.id]).await?;
        ok_body(&reply)?.finish()?;
        debug!(id = self.id, "disconnected");
        self.conn.close(VarInt::from_u32(0), b"bye");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

async fn round_trip(conn: &quinn::Connection, frame: &[u8]) -> Result<Vec<u8>, Error> {
    let (mut send, mut recv) = conn.open_bi().await?;
    send.write_all(frame).await?;
    send.finish().await?;
    let reply = recv.read_to_end(MAX_REPLY_BYTES).await?;
    trace!(sent = frame.len(), received = reply.len(), "round trip");
    Ok(reply)
}

/// Checks a raw reply's status and returns its body.
pub fn ok_body(reply: &[u8]) -> Result<Reader<'_>, Error> {
    if reply.is_empty() {
        return Err(Error::NoReply);
    }
    match decode_reply(reply)? {
        ReplyBody::Ok(body) => Ok(body),
        ReplyBody::Err { code, message } => Err(Error::Remote { code, message }),
    }
}

/// Decodes the reply to a fetch.
pub fn decode_value(reply: &[u8]) -> Result<f64, Error> {
    let mut body = ok_body(reply)?;
    let value = body.f64("value")?;
    body.finish()?;
    Ok(value)
}

fn expect_flag(reply: &[u8]) -> Result<(), Error> {
    let mut body = ok_body(reply)?;
    body.bool("flag")?;
    body.finish()?;
    Ok(())
}
