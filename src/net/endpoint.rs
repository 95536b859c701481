use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use quinn::{ConnectionError, ReadToEndError, RecvStream, SendStream, VarInt};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use super::{
    tls::TlsSource, transport_config, Error, DEFAULT_KEEP_ALIVE, DEFAULT_PORT,
    MAX_REQUEST_BYTES,
};
use crate::engine::{
    config::EngineConfig,
    error::EngineError,
    wire::Reply,
    Engine,
};

#[derive(Clone, Debug, TypedBuilder)]
pub struct ServerConfig {
    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))]
    pub listen: SocketAddr,
    #[builder(default)]
    pub tls: TlsSource,
    #[builder(default = MAX_REQUEST_BYTES)]
    pub max_request_bytes: usize,
    #[builder(default = Some(DEFAULT_KEEP_ALIVE))]
    pub keep_alive: Option<Duration>,
    #[builder(default)]
    pub engine: EngineConfig,
}

/// A raw request and where its reply goes.
type Request = (Vec<u8>, oneshot::Sender<Reply>);

/// State every stream task needs.
struct Shared {
    requests: mpsc::UnboundedSender<Request>,
    shutdown: watch::Sender<bool>,
    max_request_bytes: usize,
}

/// A running server: a QUIC endpoint feeding a single engine task.
///
/// Each request travels on its own bidirectional stream, so requests from one
/// client are not ordered by the transport. The engine task restores the
/// order using the epochs in the requests.
pub struct Server {
    endpoint: quinn::Endpoint,
    certificate: Vec<u8>,
    shared: Arc<Shared>,
    engine: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl Server {
    /// Binds the endpoint and spawns the engine and acceptor tasks. Must be
    /// called from within a tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self, Error> {
        let identity = config.tls.load()?;
        let certificate = identity.leaf_der().to_vec();

        let mut server_config =
            quinn::ServerConfig::with_single_cert(identity.chain, identity.key)?;
        server_config.transport_config(transport_config(config.keep_alive));
        let endpoint = quinn::Endpoint::server(server_config, config.listen)?;

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            requests,
            shutdown,
            max_request_bytes: config.max_request_bytes,
        });

        let engine = tokio::spawn(
            run_engine(Engine::new(config.engine), requests_rx, shared.shutdown.subscribe())
                .instrument(debug_span!("engine")),
        );
        let engine = tokio::spawn(supervise_engine(engine, shared.clone()));
        let acceptor = tokio::spawn(accept_connections(
            endpoint.clone(),
            shared.clone(),
            shared.shutdown.subscribe(),
        ));
        info!(addr = %endpoint.local_addr()?, "server listening");

        Ok(Self {
            endpoint,
            certificate,
            shared,
            engine,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// DER of the certificate the server presents.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Stops accepting connections and stops the engine. Requests already
    /// handed to the engine may still be answered.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Resolves once the server has been told to stop, locally or by a
    /// client's shutdown command.
    pub async fn stopped(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        // the flag only ever goes from false to true
        let _ = rx.changed().await;
    }

    /// Shuts down and waits for the endpoint to go idle.
    pub async fn close(self) {
        self.shutdown();
        let _ = self.engine.await;
        let _ = self.acceptor.await;
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.endpoint.wait_idle().await;
        info!("server closed");
    }
}

/// Owns the engine. Every request goes through here one at a time.
async fn run_engine(
    mut engine: Engine<oneshot::Sender<Reply>>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let (frame, reply_to) = select! {
            Some(request) = requests.recv() => request,
            _ = stopped.changed() => break,
            else => break,
        };
        for (reply_to, reply) in engine.dispatch(&frame, reply_to) {
            let stopping = matches!(reply, Reply::ShuttingDown);
            if reply_to.send(reply).is_err() {
                trace!("requester went away before its reply");
            }
            if stopping {
                // the stream task raises the shutdown signal once the reply
                // is delivered
                info!("engine stopping");
                return;
            }
        }
    }
    info!(arrays = engine.store().len(), "engine stopped");
}

/// Stops the whole server if the engine task dies, so clients are not left
/// waiting on a server that can no longer answer.
async fn supervise_engine(engine: JoinHandle<()>, shared: Arc<Shared>) {
    match engine.await {
        Ok(()) => debug!("engine task finished"),
        Err(e) => {
            error!(error = %e, "engine task failed, stopping server");
            shared.shutdown.send_replace(true);
        }
    }
}

async fn accept_connections(
    endpoint: quinn::Endpoint,
    shared: Arc<Shared>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let connecting = select! {
            connecting = endpoint.accept() => match connecting {
                Some(connecting) => connecting,
                None => break,
            },
            _ = stopped.changed() => break,
        };
        let remote = connecting.remote_address();
        let shared = shared.clone();
        tokio::spawn(
            async move {
                match handle_connection(connecting, shared).await {
                    Ok(()) => debug!("connection closed"),
                    Err(e) => debug!(error = %e, "connection failed"),
                }
            }
            .instrument(debug_span!("connection", %remote)),
        );
    }
    debug!("acceptor stopped");
}

async fn handle_connection(
    connecting: quinn::Connecting,
    shared: Arc<Shared>,
) -> Result<(), Error> {
    let conn = connecting.await?;
    debug!("connected via QUIC");
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed) => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        let shared = shared.clone();
        let span = debug_span!("stream", id = ?send.id());
        tokio::spawn(
            async move {
                if let Err(e) = handle_stream(send, recv, &shared).await {
                    debug!(error = %e, "stream failed");
                }
            }
            .instrument(span),
        );
    }
}

/// One request, one reply. A request that produces no reply, like a stale
/// duplicate, gets its stream finished with nothing written.
async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    shared: &Shared,
) -> Result<(), Error> {
    let frame = match recv.read_to_end(shared.max_request_bytes).await {
        Ok(frame) => frame,
        Err(ReadToEndError::TooLong) => {
            warn!(limit = shared.max_request_bytes, "request too large");
            let reply = Reply::Failed(EngineError::ResourceExhausted(format!(
                "request exceeds {} bytes",
                shared.max_request_bytes
            )));
            send.write_all(&reply.encode()).await?;
            send.finish().await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    trace!(len = frame.len(), "read request");

    let (reply_tx, reply_rx) = oneshot::channel();
    shared
        .requests
        .send((frame, reply_tx))
        .map_err(|_| Error::EngineStopped)?;

    match reply_rx.await {
        Ok(reply) => {
            let stopping = matches!(reply, Reply::ShuttingDown);
            send.write_all(&reply.encode()).await?;
            send.finish().await?;
            if stopping {
                shared.shutdown.send_replace(true);
            }
        }
        Err(_) => {
            trace!("no reply for this request");
            send.finish().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<Shared> {
        let (requests, _) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Shared {
            requests,
            shutdown,
            max_request_bytes: MAX_REQUEST_BYTES,
        })
    }

    #[tokio::test]
    async fn engine_panic_stops_the_server() {
        let shared = shared();
        let stopped = shared.shutdown.subscribe();
        let engine = tokio::spawn(async {
            panic!("kernel failure");
        });
        supervise_engine(engine, shared.clone()).await;
        assert!(*shared.shutdown.borrow());
        assert!(stopped.has_changed().unwrap());
    }

    #[tokio::test]
    async fn engine_exit_leaves_the_flag_alone() {
        let shared = shared();
        let engine = tokio::spawn(async {});
        supervise_engine(engine, shared.clone()).await;
        assert!(!*shared.shutdown.borrow());
    }
}
