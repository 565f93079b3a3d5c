// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Flowmesh demo driver.
//!
//! `flowmesh throughput` runs the classic three-context layout: two
//! unthrottled noise emitters feeding a product router feeding a
//! throughput probe, each stage in its own execution context. The probe
//! logs its rate when the run ends.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use flowmesh_config::{Endpoints, NodeId};
use flowmesh_nodes::{Lambda, Noise, Throughput};
use flowmesh_orchestrator::{Error, Layout, Orchestrator};
use std::time::Duration;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowmesh", about = "Multi-context dataflow graph executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the two-noise -> product -> throughput demo layout.
    Throughput {
        /// How long to let the graph run.
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },
}

struct ThroughputLayout {
    duration: Duration,
}

#[async_trait(?Send)]
impl Layout for ThroughputLayout {
    async fn setup(&mut self, orch: &mut Orchestrator) -> Result<(), Error> {
        let ctx1 = orch.new_context()?;
        let ctx2 = orch.new_context()?;
        let ctx3 = orch.new_context()?;

        let p1 = Noise::blueprint_with_id(NodeId::from("noise-a"), Duration::ZERO);
        let p2 = Noise::blueprint_with_id(NodeId::from("noise-b"), Duration::ZERO);
        let p3 = Lambda::blueprint_with_id(NodeId::from("product"), |args| args[0] * args[1]);
        let p4 = Throughput::blueprint_with_id(NodeId::from("meter"), None);

        orch.add(p1, &ctx1).await?;
        orch.add(p2, &ctx1).await?;
        orch.add(p3, &ctx2).await?;
        orch.add(p4, &ctx3).await?;

        orch.connect(&NodeId::from("noise-a"), &NodeId::from("product"), None)
            .await?;
        orch.connect(&NodeId::from("noise-b"), &NodeId::from("product"), None)
            .await?;
        orch.connect(&NodeId::from("product"), &NodeId::from("meter"), None)
            .await?;
        Ok(())
    }

    async fn run(&mut self, orch: &mut Orchestrator) -> Result<(), Error> {
        info!(duration = ?self.duration, "throughput demo running");
        tokio::time::sleep(self.duration).await;
        // Graceful per-node teardown so the meter reports its rate.
        let contexts: Vec<_> = [
            orch.context_of(&NodeId::from("noise-a")).cloned(),
            orch.context_of(&NodeId::from("product")).cloned(),
            orch.context_of(&NodeId::from("meter")).cloned(),
        ]
        .into_iter()
        .flatten()
        .collect();
        for ctx in contexts {
            orch.clear_context(&ctx).await?;
        }
        Ok(())
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    let local = LocalSet::new();

    match cli.command {
        Command::Throughput { duration } => {
            let mut orch = Orchestrator::new(Endpoints::default());
            let mut layout = ThroughputLayout { duration };
            rt.block_on(local.run_until(orch.execute(&mut layout)))
        }
    }
}
