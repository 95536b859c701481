use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use arrayd::{
    engine::{
        ast::{AstNode, Opcode},
        config::EngineConfig,
        wire::{encode_operation, CommandKind, Creation, Initializer},
    },
    net::{
        client::{decode_value, Client},
        endpoint::{Server, ServerConfig},
        tls::TlsSource,
        Error, DEFAULT_PORT, MAX_REQUEST_BYTES,
    },
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arrayd", about = "Array computation server over QUIC")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server until interrupted
    Serve(ServeArgs),
    /// Run a short session against a server, starting one in-process if no
    /// address is given
    Demo(DemoArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))]
    listen: SocketAddr,
    /// Hostnames for the self-signed certificate
    #[arg(long = "hostname", default_value = "localhost")]
    hostnames: Vec<String>,
    /// PEM certificate chain, instead of a self-signed certificate
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key for --cert
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Write the server certificate here as DER, for clients to trust
    #[arg(long)]
    cert_out: Option<PathBuf>,
    #[arg(long, default_value_t = MAX_REQUEST_BYTES)]
    max_request_bytes: usize,
    /// Keep-alive interval in seconds, 0 to disable
    #[arg(long, default_value_t = 5)]
    keep_alive_secs: u64,
    /// Always allocate fresh results instead of reusing transient buffers
    #[arg(long)]
    no_in_place: bool,
    #[arg(long, default_value_t = 64)]
    max_ast_depth: usize,
    #[arg(long, default_value_t = 1 << 28)]
    max_array_elements: u64,
    /// Let clients stop the server with a shutdown command
    #[arg(long)]
    allow_remote_shutdown: bool,
}

#[derive(Args)]
struct DemoArgs {
    /// Server to talk to
    #[arg(long, requires = "trust")]
    connect: Option<SocketAddr>,
    /// DER certificate of the server
    #[arg(long)]
    trust: Option<PathBuf>,
    #[arg(long, default_value = "localhost")]
    server_name: String,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        let tls = match (self.cert, self.key) {
            (Some(cert), Some(key)) => TlsSource::Pem { cert, key },
            _ => TlsSource::SelfSigned(self.hostnames),
        };
        let keep_alive =
            (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs));
        ServerConfig::builder()
            .listen(self.listen)
            .tls(tls)
            .max_request_bytes(self.max_request_bytes)
            .keep_alive(keep_alive)
            .engine(
                EngineConfig::builder()
                    .in_place_updates(!self.no_in_place)
                    .max_ast_depth(self.max_ast_depth)
                    .max_array_elements(self.max_array_elements)
                    .allow_remote_shutdown(self.allow_remote_shutdown)
                    .build(),
            )
            .build()
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Demo(args) => demo(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), Error> {
    let cert_out = args.cert_out.clone();
    let server = Server::bind(args.into_config())?;
    if let Some(path) = cert_out {
        fs::write(&path, server.certificate_der())?;
        info!(path = %path.display(), "wrote server certificate");
    }

    tokio::select! {
        _ = server.stopped() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "could not listen for ctrl-c");
            }
        }
    }
    server.close().await;
    Ok(())
}

async fn demo(args: DemoArgs) -> Result<(), Error> {
    let (server, addr, cert) = match (args.connect, args.trust) {
        (Some(addr), Some(trust)) => (None, addr, fs::read(trust)?),
        _ => {
            let config = ServerConfig::builder()
                .listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
                .build();
            let server = Server::bind(config)?;
            let addr = server.local_addr()?;
            let cert = server.certificate_der().to_vec();
            (Some(server), addr, cert)
        }
    };

    let client = Client::connect(addr, &args.server_name, &cert).await?;
    info!(id = client.id(), %addr, "connected");

    let x = client.vector(vec![1.0, 2.0, 3.0, 4.0, 5.0]).await?;
    let y = client.create(&[5], Initializer::Fill(2.0)).await?;
    let dot = client.next_name();
    let tree = AstNode::op(Opcode::Matmul, dot, true, vec![AstNode::Name(x), AstNode::Name(y)]);
    client.evaluate(&[], &tree).await?;
    let value = client.fetch(dot).await?;
    info!(value, "x . y");

    // issue a creation, an update and a fetch, then send them newest first
    let z = client.next_name();
    let w = client.next_name();
    let creation = Creation { name: z, dims: vec![5], init: Initializer::Fill(1.0) };
    let axpy = AstNode::op(
        Opcode::Matmul,
        w,
        true,
        vec![
            AstNode::op(
                Opcode::Axpy,
                z,
                true,
                vec![AstNode::Literal(0.5), AstNode::Name(x), AstNode::Name(z)],
            ),
            AstNode::Name(y),
        ],
    );
    let mut frames = vec![
        client.prepare(CommandKind::Creation, &creation.encode()),
        client.prepare(CommandKind::Operation, &encode_operation(&[], &axpy)),
        client.prepare(CommandKind::Fetch, &w.0.to_le_bytes()),
    ];
    frames.reverse();
    let replies = client.send_all(&frames).await;
    if let Some(reply) = replies.into_iter().next() {
        let value = decode_value(&reply?)?;
        info!(value, "(0.5 x + 1) . y, sent out of order");
    }

    client.sync().await?;
    client.disconnect().await?;
    if let Some(server) = server {
        server.close().await;
    }
    Ok(())
}
