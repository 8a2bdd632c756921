//! dsync CLI - replication demo
//!
//! Runs two replicas of one suffix behind an in-process relay, makes them
//! collide on a name, and shows how both settle on the same tree.
//!
//! Usage:
//!   dsync
//!   dsync --assured safe-data --level 2 --timeout-ms 500
//!   dsync --config replica1.json --config replica2.json --json

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use dsync_core::transport::{LocalRelay, Topology};
use dsync_core::{
    AssuredConfig, AttrDesc, Dn, DomainConfig, GroupId, Rdn, ReplicaId, ReplicationDomain,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod ui;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Assured {
    None,
    SafeData,
    SafeRead,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Replica configuration file (JSON); give it twice, or not at all
    #[arg(short, long)]
    config: Vec<PathBuf>,

    /// Suffix replicated when no configuration is given
    #[arg(short, long, default_value = "dc=example,dc=com")]
    base_dn: String,

    /// Assured mode for the demo writes
    #[arg(short, long, value_enum, default_value = "safe-read")]
    assured: Assured,

    /// Safe Data level
    #[arg(short, long, default_value_t = 2)]
    level: u8,

    /// How long a writer waits for its ack
    #[arg(short, long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Print final statistics as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn assured_config(&self) -> AssuredConfig {
        let timeout = Duration::from_millis(self.timeout_ms);
        match self.assured {
            Assured::None => AssuredConfig::default(),
            Assured::SafeData => AssuredConfig::safe_data(self.level, timeout),
            Assured::SafeRead => AssuredConfig::safe_read(timeout),
        }
    }

    fn replica_configs(&self) -> Result<Vec<DomainConfig>> {
        match self.config.len() {
            0 => {
                let base = Dn::parse(&self.base_dn)?;
                Ok((1..=2)
                    .map(|id| DomainConfig::new(base.clone(), ReplicaId(id)).with_assured(self.assured_config()))
                    .collect())
            }
            2 => {
                let configs = self
                    .config
                    .iter()
                    .map(DomainConfig::from_json_file)
                    .collect::<dsync_core::Result<Vec<_>>>()?;
                if configs[0].base_dn != configs[1].base_dn {
                    bail!("replicas serve different suffixes: {} and {}", configs[0].base_dn, configs[1].base_dn);
                }
                if configs[0].replica_id == configs[1].replica_id {
                    bail!("both replicas use id {}", configs[0].replica_id);
                }
                Ok(configs)
            }
            n => bail!("expected two --config files, got {}", n),
        }
    }
}

fn attrs(pairs: &[(&str, &str)]) -> Vec<(AttrDesc, Vec<String>)> {
    pairs
        .iter()
        .map(|(attr, value)| (AttrDesc::new(attr), vec![value.to_string()]))
        .collect()
}

/// Give the relay and the replay workers time to drain
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();
    ui::print_banner();

    let configs = args.replica_configs()?;
    let base = configs[0].base_dn.clone();
    let relay = LocalRelay::start(ReplicaId(100), GroupId::default(), Duration::from_millis(args.timeout_ms));
    let topology = Topology::new(relay.relay_id(), relay.group_id());

    let mut domains = Vec::new();
    for config in configs {
        let session = relay.connect(config.replica_id, config.group_id);
        let domain = ReplicationDomain::builder(config).with_topology(topology).build(Arc::new(session))?;
        domain.start()?;
        domains.push(domain);
    }
    let (first, second) = (&domains[0], &domains[1]);
    let names = [
        format!("replica {}", first.replica_id()),
        format!("replica {}", second.replica_id()),
    ];
    info!(suffix = %base, relay = %relay.relay_id(), "Demo replicas started");
    ui::print_info(&format!("Suffix {} served by {} and {}", base, names[0], names[1]));

    ui::print_step("Create the suffix and an organizational unit");
    let people = base.child(Rdn::new("ou", "people"));
    let result = first.add(&base, attrs(&[("objectClass", "domain")])).await?;
    ui::print_write(&names[0], &result);
    let result = first.add(&people, attrs(&[("objectClass", "organizationalUnit")])).await?;
    ui::print_write(&names[0], &result);
    settle().await;

    ui::print_step("Both replicas add the same name concurrently");
    let alice = people.child(Rdn::new("cn", "alice"));
    let (left, right) = tokio::join!(
        first.add(&alice, attrs(&[("objectClass", "person"), ("sn", "written on replica 1")])),
        second.add(&alice, attrs(&[("objectClass", "person"), ("sn", "written on replica 2")])),
    );
    for (name, result) in names.iter().zip([left, right]) {
        match result {
            Ok(result) => ui::print_write(name, &result),
            Err(e) => ui::print_error(&format!("{}: {}", name, e)),
        }
    }
    settle().await;
    for (name, domain) in names.iter().zip(&domains) {
        ui::print_tree(name, domain)?;
    }

    ui::print_step("The older entry is deleted, the conflicting one takes its name back");
    match first.delete(&alice, false).await {
        Ok(result) => ui::print_write(&names[0], &result),
        Err(e) => ui::print_error(&e.to_string()),
    }
    settle().await;
    for (name, domain) in names.iter().zip(&domains) {
        ui::print_tree(name, domain)?;
    }

    let same = first.store().all_entries()?.len() == second.store().all_entries()?.len()
        && first.read(&alice)?.map(|e| e.uuid) == second.read(&alice)?.map(|e| e.uuid);
    if same {
        ui::print_success("Replicas converged");
    } else {
        ui::print_warning("Replicas still differ");
    }

    ui::print_step("Counters");
    let stats: Vec<_> = domains.iter().map(|d| d.metrics()).collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for (name, stats) in names.iter().zip(&stats) {
            ui::print_stats(name, stats);
        }
    }

    for domain in &domains {
        domain.shutdown().await;
    }
    println!();
    println!("{}", "Done.".bright_cyan());
    Ok(())
}
