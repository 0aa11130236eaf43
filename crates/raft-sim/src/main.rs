//! # raft-sim
//!
//! why: watch a whole cluster elect, replicate and recover from the command line
//! relations: drives raft-core over its LocalNetwork with raft-storage memory persisters
//! what: cli flags, cluster bootstrap, command submission, optional leader partition, status report

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use raft_core::{ApplyMsg, LocalNetwork, NodeId, RaftConfig, RaftNode};
use raft_storage::MemoryPersister;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raft-sim", about = "Run an in-process raft cluster and report what every node applies")]
struct Args {
    /// Cluster size
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Commands to submit through the leader
    #[arg(long, default_value_t = 5)]
    commands: usize,

    /// Cut the leader off halfway through and heal the partition at the end
    #[arg(long)]
    partition_leader: bool,

    /// Delay and drop messages at random
    #[arg(long)]
    unreliable: bool,

    /// JSON file overriding timing settings
    #[arg(long)]
    config: Option<PathBuf>,
}

struct Sim {
    net: LocalNetwork,
    nodes: Vec<Arc<RaftNode>>,
}

impl Sim {
    fn start(size: u64, config: &RaftConfig) -> Result<Self> {
        let net = LocalNetwork::new();
        let ids: Vec<NodeId> = (1..=size).collect();
        let mut nodes = Vec::with_capacity(ids.len());

        for &id in &ids {
            let (tx, rx) = mpsc::channel(256);
            let node = RaftNode::spawn(
                id,
                ids.clone(),
                net.endpoint(id),
                Arc::new(MemoryPersister::new()),
                config.clone(),
                tx,
            )
            .with_context(|| format!("starting node {id}"))?;
            net.register(&node);
            tokio::spawn(print_applies(id, rx));
            nodes.push(node);
        }
        Ok(Self { net, nodes })
    }

    fn leader(&self) -> Option<&Arc<RaftNode>> {
        self.nodes
            .iter()
            .filter(|node| self.net.is_connected(node.id()))
            .filter(|node| node.get_state().1)
            .max_by_key(|node| node.get_state().0)
    }

    async fn wait_leader(&self) -> Result<Arc<RaftNode>> {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(10) {
            if let Some(leader) = self.leader() {
                return Ok(Arc::clone(leader));
            }
            sleep(Duration::from_millis(20)).await;
        }
        bail!("no leader elected within 10s")
    }

    /// Keep submitting `command` to the current leader until it commits there.
    async fn submit(&self, command: &str) -> Result<u64> {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(20) {
            let leader = self.wait_leader().await?;
            let (index, term, accepted) = leader.start(command.as_bytes().to_vec());
            if !accepted {
                sleep(Duration::from_millis(20)).await;
                continue;
            }
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if leader.status().commit_index >= index
                    && leader.committed_log().get(index as usize - 1).map(Vec::as_slice)
                        == Some(command.as_bytes())
                {
                    info!(leader = leader.id(), term, index, command, "committed");
                    return Ok(index);
                }
                sleep(Duration::from_millis(5)).await;
            }
            warn!(leader = leader.id(), term, index, command, "not committed, retrying");
        }
        bail!("command {command:?} never committed")
    }

    fn report(&self) -> Result<bool> {
        for node in &self.nodes {
            println!("{}", serde_json::to_string(&node.status())?);
        }
        let reference = self.nodes[0].committed_log();
        Ok(self.nodes.iter().all(|node| node.committed_log() == reference))
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.kill();
        }
    }
}

async fn print_applies(id: NodeId, mut rx: mpsc::Receiver<ApplyMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command } => {
                println!("node {id} applied #{index}: {}", String::from_utf8_lossy(&command));
            }
            ApplyMsg::Snapshot { index, .. } => println!("node {id} received snapshot at #{index}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    ensure!(args.nodes > 0, "a cluster needs at least one node");
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            RaftConfig::from_json_str(&json)?
        }
        None => RaftConfig::default(),
    };

    let sim = Sim::start(args.nodes, &config)?;
    sim.net.set_reliable(!args.unreliable);

    let leader = sim.wait_leader().await?;
    info!(leader = leader.id(), term = leader.get_state().0, "leader elected");

    let mut partitioned = None;
    for i in 0..args.commands {
        if args.partition_leader && partitioned.is_none() && i == args.commands / 2 {
            let leader = sim.wait_leader().await?;
            info!(node = leader.id(), "partitioning leader");
            sim.net.disconnect(leader.id());
            partitioned = Some(leader.id());
        }
        sim.submit(&format!("cmd-{i}")).await?;
    }

    if let Some(id) = partitioned {
        info!(node = id, "healing partition");
        sim.net.connect(id);
    }
    sim.net.set_reliable(true);
    sleep(config.heartbeat_interval * 4).await;

    let consistent = sim.report()?;
    info!(rpcs = sim.net.rpc_count(), consistent, "simulation finished");
    sim.shutdown();
    ensure!(consistent, "committed logs diverged");
    Ok(())
}
