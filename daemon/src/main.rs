use clap::{Parser, Subcommand};
use ross_net::{Configuration, VirtualNetwork};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixDatagram, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Datagram a vfkit client sends before frames start flowing.
const VFKIT_MAGIC: &[u8] = b"VFKT";

#[derive(Parser)]
#[command(name = "ross-netd")]
#[command(about = "Ross userspace virtual network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the virtual network
    Run {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log every frame crossing the switch
        #[arg(long)]
        debug: bool,

        #[arg(long)]
        mtu: Option<usize>,

        /// Subnet of the virtual network, e.g. 192.168.127.0/24
        #[arg(long)]
        subnet: Option<String>,

        /// Write every frame to this pcap file
        #[arg(long)]
        capture_file: Option<PathBuf>,

        /// Accept qemu clients (tcp://host:port or unix:///path)
        #[arg(long)]
        listen_qemu: Option<String>,

        /// Accept hyperkit clients (unix:///path)
        #[arg(long)]
        listen_hyperkit: Option<String>,

        /// Accept hyperkit clients speaking the vpnkit handshake (unix:///path)
        #[arg(long)]
        listen_vpnkit: Option<String>,

        /// Accept a vfkit client (unixgram:///path)
        #[arg(long)]
        listen_vfkit: Option<String>,

        /// Serve a single client over stdin/stdout
        #[arg(long)]
        listen_stdio: bool,

        /// Serve the HTTP API (tcp://host:port)
        #[arg(long)]
        services: Option<String>,
    },
}

#[derive(Debug, PartialEq)]
enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
    Unixgram(PathBuf),
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    if let Some(addr) = s.strip_prefix("tcp://") {
        return Ok(Endpoint::Tcp(addr.to_string()));
    }
    if let Some(path) = s.strip_prefix("unixgram://") {
        return Ok(Endpoint::Unixgram(PathBuf::from(path)));
    }
    if let Some(path) = s.strip_prefix("unix://") {
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    Err(format!("unsupported endpoint {:?}", s))
}

fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e);
        }
    }
    UnixListener::bind(path)
}

#[derive(Clone, Copy)]
enum StreamKind {
    Qemu,
    Hyperkit,
    Vpnkit,
}

async fn serve_streams(
    vn: Arc<VirtualNetwork>,
    endpoint: Endpoint,
    kind: StreamKind,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(&addr).await?;
            tracing::info!("Listening on tcp://{}", addr);
            loop {
                let (stream, peer) = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = listener.accept() => res?,
                };
                let _ = stream.set_nodelay(true);
                spawn_client(vn.clone(), stream, peer.to_string(), kind);
            }
        }
        Endpoint::Unix(path) => {
            let listener = bind_unix(&path)?;
            tracing::info!("Listening on unix://{}", path.display());
            loop {
                let (stream, _) = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = listener.accept() => res?,
                };
                spawn_client(vn.clone(), stream, path.display().to_string(), kind);
            }
        }
        Endpoint::Unixgram(_) => Err("stream clients need a tcp:// or unix:// endpoint".into()),
    }
}

fn spawn_client<S>(vn: Arc<VirtualNetwork>, stream: S, peer: String, kind: StreamKind)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(peer = %peer, "client connected");
        let res = match kind {
            StreamKind::Qemu => vn.accept_qemu(stream, peer.clone()).await,
            StreamKind::Hyperkit => vn.accept_hyperkit(stream, peer.clone()).await,
            StreamKind::Vpnkit => vn.accept_vpnkit(stream, peer.clone()).await,
        };
        match res {
            Ok(()) => tracing::info!(peer = %peer, "client disconnected"),
            Err(e) => tracing::error!(peer = %peer, error = %e, "client failed"),
        }
    });
}

/// Waits for the vfkit magic datagram, then serves its sender.
async fn serve_vfkit(vn: Arc<VirtualNetwork>, path: PathBuf) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    let socket = UnixDatagram::bind(&path)?;
    tracing::info!("Waiting for vfkit on unixgram://{}", path.display());

    let mut buf = [0u8; 64];
    let peer = loop {
        let (n, addr) = socket.recv_from(&mut buf).await?;
        if &buf[..n] != VFKIT_MAGIC {
            tracing::warn!("ignoring datagram before the vfkit handshake");
            continue;
        }
        match addr.as_pathname() {
            Some(peer) => break peer.to_path_buf(),
            None => tracing::warn!("vfkit handshake from an unnamed socket"),
        }
    };
    socket.connect(&peer)?;
    let peer = peer.display().to_string();
    tracing::info!(peer = %peer, "vfkit connected");
    vn.accept_vfkit(Arc::new(socket), peer).await?;
    Ok(())
}

async fn serve_api(
    vn: Arc<VirtualNetwork>,
    endpoint: Endpoint,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Endpoint::Tcp(addr) = endpoint else {
        return Err("the services endpoint must be tcp://host:port".into());
    };
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Serving the HTTP API on {}", addr);
    axum::serve(
        listener,
        vn.mux().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

fn log_failure(what: &'static str, res: Result<(), Box<dyn std::error::Error + Send + Sync>>) {
    if let Err(e) = res {
        tracing::error!("{} failed: {}", what, e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            debug,
            mtu,
            subnet,
            capture_file,
            listen_qemu,
            listen_hyperkit,
            listen_vpnkit,
            listen_vfkit,
            listen_stdio,
            services,
        } => {
            let mut configuration = match config {
                Some(path) => Configuration::from_file(&path)?,
                None => Configuration::default(),
            };
            configuration.debug |= debug;
            if let Some(mtu) = mtu {
                configuration.mtu = mtu;
            }
            if let Some(subnet) = subnet {
                configuration.subnet = subnet;
            }
            if capture_file.is_some() {
                configuration.capture_file = capture_file;
            }

            let default_level = if configuration.debug { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            let vn = Arc::new(VirtualNetwork::new(configuration).await?);
            let cancel = vn.cancellation_token();
            let mut tasks = tokio::task::JoinSet::new();

            if let Some(endpoint) = services {
                tasks.spawn({
                    let vn = vn.clone();
                    let cancel = cancel.clone();
                    let endpoint = parse_endpoint(&endpoint)?;
                    async move { log_failure("HTTP API", serve_api(vn, endpoint, cancel).await) }
                });
            }
            for (endpoint, kind) in [
                (listen_qemu, StreamKind::Qemu),
                (listen_hyperkit, StreamKind::Hyperkit),
                (listen_vpnkit, StreamKind::Vpnkit),
            ] {
                let Some(endpoint) = endpoint else { continue };
                let endpoint = parse_endpoint(&endpoint)?;
                let vn = vn.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    log_failure("listener", serve_streams(vn, endpoint, kind, cancel).await)
                });
            }
            if let Some(endpoint) = listen_vfkit {
                let Endpoint::Unixgram(path) = parse_endpoint(&endpoint)? else {
                    return Err("--listen-vfkit needs a unixgram:// endpoint".into());
                };
                let vn = vn.clone();
                tasks.spawn(async move { log_failure("vfkit", serve_vfkit(vn, path).await) });
            }
            if listen_stdio {
                let vn = vn.clone();
                tasks.spawn(async move {
                    if let Err(e) = vn.accept_stdio(tokio::io::stdin(), tokio::io::stdout()).await {
                        tracing::error!("stdio client failed: {}", e);
                    }
                });
            }

            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    tracing::info!("Received interrupt, shutting down");
                }
                _ = cancel.cancelled() => {}
            }
            vn.shutdown();
            tasks.abort_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:1234").unwrap(),
            Endpoint::Tcp("127.0.0.1:1234".to_string())
        );
        assert_eq!(
            parse_endpoint("unix:///tmp/net.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/net.sock"))
        );
        assert_eq!(
            parse_endpoint("unixgram:///tmp/vfkit.sock").unwrap(),
            Endpoint::Unixgram(PathBuf::from("/tmp/vfkit.sock"))
        );
        assert!(parse_endpoint("vsock://2:1024").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "ross-netd",
            "run",
            "--debug",
            "--mtu",
            "4000",
            "--listen-qemu",
            "tcp://127.0.0.1:1234",
            "--services",
            "tcp://127.0.0.1:8080",
        ])
        .unwrap();
        let Commands::Run {
            debug,
            mtu,
            listen_qemu,
            services,
            ..
        } = cli.command;
        assert!(debug);
        assert_eq!(mtu, Some(4000));
        assert_eq!(listen_qemu.as_deref(), Some("tcp://127.0.0.1:1234"));
        assert_eq!(services.as_deref(), Some("tcp://127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn test_vfkit_magic_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("net.sock");
        let client_path = dir.path().join("vfkit.sock");

        let mut config = Configuration::default();
        config.hosts_file = None;
        config.resolv_conf = None;
        let vn = Arc::new(VirtualNetwork::new(config).await.unwrap());
        tokio::spawn(serve_vfkit(vn.clone(), server_path.clone()));
        for _ in 0..50 {
            if server_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let client = UnixDatagram::bind(&client_path).unwrap();
        client.send_to(VFKIT_MAGIC, &server_path).await.unwrap();
        for _ in 0..50 {
            if vn.stats().connections == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(vn.stats().connections, 1);
        vn.shutdown();
    }
}
