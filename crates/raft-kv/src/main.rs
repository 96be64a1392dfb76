use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use raft_core::{ApplyResult, Command, RaftConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raft_kv::config::{parse_peers, NodeConfig};
use raft_kv::node::NodeBuilder;
use raft_kv::transport::tcp::{self, Frame, FrameReply};
use raft_kv::transport::TcpTransport;

#[derive(Parser, Debug)]
#[command(name = "kv-node")]
#[command(version)]
#[command(about = "A replicated key-value store on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a cluster node
    Server(ServerArgs),

    /// Store a value
    Put {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
        value: String,
    },

    /// Read a value through the log
    Get {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },

    /// Remove a key
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        key: String,
    },

    /// Show a node's role, term and log position
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique within the cluster)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Address to listen on for peers and clients
    #[arg(long, default_value = "127.0.0.1:7001")]
    listen: SocketAddr,

    /// Peers (comma-separated, format: "id=host:port")
    /// Example: "2=127.0.0.1:7002,3=127.0.0.1:7003"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for the term/vote file, the log and the snapshot
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[arg(long, default_value = "150")]
    election_timeout_min: u64,

    #[arg(long, default_value = "300")]
    election_timeout_max: u64,

    #[arg(long, default_value = "50")]
    heartbeat_interval: u64,

    /// Log length that triggers a snapshot
    #[arg(long, default_value = "1000")]
    snapshot_threshold: usize,

    /// Per-rpc timeout in milliseconds
    #[arg(long, default_value = "100")]
    rpc_timeout: u64,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node to send the request to
    #[arg(long, short = 'a', default_value = "127.0.0.1:7001")]
    addr: String,
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr: args.listen,
        peers: parse_peers(&args.peers)?,
        data_dir: args.data_dir,
        rpc_timeout_ms: args.rpc_timeout,
        raft: RaftConfig {
            election_timeout_min: args.election_timeout_min,
            election_timeout_max: args.election_timeout_max,
            heartbeat_interval: args.heartbeat_interval,
            snapshot_threshold: args.snapshot_threshold,
        },
    };
    config.validate()?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    let transport = Arc::new(TcpTransport::new(config.peer_addrs()));
    let node = NodeBuilder::from_config(&config)?.start(transport)?;
    info!(
        node_id = config.node_id,
        listen = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "kv-node listening"
    );

    let shutdown = node.shutdown_token();
    let server = tokio::spawn(tcp::serve(
        listener,
        node.clone(),
        config.peer_addrs(),
        shutdown.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
        _ = shutdown.cancelled() => info!("node halted"),
    }
    node.shutdown().await;
    server.await??;
    Ok(())
}

/// Send one frame, following a single NotLeader redirect
async fn client_request(addr: &str, frame: Frame) -> Result<FrameReply, Box<dyn std::error::Error>> {
    let reply = tcp::request(addr, &frame).await?;
    if let FrameReply::NotLeader {
        leader_addr: Some(leader),
        ..
    } = &reply
    {
        return Ok(tcp::request(leader, &frame).await?);
    }
    Ok(reply)
}

fn print_reply(reply: FrameReply) -> Result<(), Box<dyn std::error::Error>> {
    match reply {
        FrameReply::Applied(ApplyResult::Ok) => println!("OK"),
        FrameReply::Applied(ApplyResult::Value(Some(value))) => println!("{value}"),
        FrameReply::Applied(ApplyResult::Value(None)) => println!("(not found)"),
        FrameReply::Status(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        FrameReply::NotLeader { leader_hint, .. } => {
            return Err(format!("not the leader (leader: {leader_hint:?})").into())
        }
        FrameReply::Failed(reason) => return Err(reason.into()),
        FrameReply::Raft(message) => {
            return Err(format!("unexpected {} reply", message.kind()).into())
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (addr, frame) = match args.command {
        Commands::Server(server_args) => return run_server(server_args).await,
        Commands::Put { client, key, value } => (client.addr, Frame::Propose(Command::put(key, value))),
        Commands::Get { client, key } => (client.addr, Frame::Propose(Command::get(key))),
        Commands::Delete { client, key } => (client.addr, Frame::Propose(Command::delete(key))),
        Commands::Status { client } => (client.addr, Frame::Status),
    };
    print_reply(client_request(&addr, frame).await?)
}
