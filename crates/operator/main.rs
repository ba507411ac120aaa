use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use mo_cluster::api::v1alpha1::{BucketClaim, CNClaim, CNPool, CNSet, CloneSet, LogSet};
use mo_cluster::controllers;
use mo_cluster::hakeeper::HttpClientFactory;
use mo_cluster::reconciler::{ensure_queryable, State};
use mo_cluster::util::config::OperatorConfig;
use mo_cluster::util::telemetry::{self, LogFormat};
use tracing::*;

mod handlers;
mod leader;
mod server;

use handlers::health::Readiness;
use leader::LeaderElector;

#[derive(Parser, Debug)]
#[command(author, version, about = "MatrixOne operator", long_about = None)]
struct Args {
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,

    /// Start controllers only while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    leader_election_namespace: String,

    /// Accepted for deployment compatibility; admission webhooks are served elsewhere
    #[arg(long)]
    webhook_certificate_directory: Option<PathBuf>,

    #[arg(long, env = "OPERATOR_CFG_DIRECTORY", default_value = "/etc/mo-operator")]
    operator_cfg_directory: PathBuf,

    /// Extra trusted root for HTTPS HAKeeper endpoints
    #[arg(long, env = "CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Evict log stores that stay down past their failure timeout
    #[arg(long, env = "FAILOVER")]
    failover: bool,

    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,
}

fn holder_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("mo-operator-{}", std::process::id()))
}

async fn check_crds(client: &kube::Client, config: &OperatorConfig) -> anyhow::Result<()> {
    ensure_queryable::<LogSet>(client).await.context("LogSet CRD")?;
    ensure_queryable::<CNSet>(client).await.context("CNSet CRD")?;
    ensure_queryable::<CloneSet>(client)
        .await
        .context("CloneSet CRD, is OpenKruise installed?")?;
    if config.feature_gates.s3_reclaim {
        ensure_queryable::<BucketClaim>(client).await.context("BucketClaim CRD")?;
    }
    if config.feature_gates.cn_pool {
        ensure_queryable::<CNPool>(client).await.context("CNPool CRD")?;
        ensure_queryable::<CNClaim>(client).await.context("CNClaim CRD")?;
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    if let Some(dir) = &args.webhook_certificate_directory {
        debug!("ignoring webhook certificates in {}", dir.display());
    }

    let mut config = OperatorConfig::load(&args.operator_cfg_directory).context("load operator config")?;
    config.failover = args.failover;
    info!("operator config: {config:?}");
    let gates = config.feature_gates.clone();

    let client = kube::Client::try_default().await.context("create kube client")?;
    check_crds(&client, &config).await?;

    let factory = HttpClientFactory::new(args.ca_file.as_deref()).context("build HAKeeper transport")?;
    let state = State::default();
    let ctx = state
        .to_context(client.clone(), config, Arc::new(factory))
        .context("register metrics")?;

    let readiness = Readiness::default();
    let metrics_server = server::metrics_server(state.clone(), &args.metrics_bind_address)?;
    let probe_server = server::probe_server(readiness.clone(), &args.health_probe_bind_address)?;
    let servers = async move { tokio::try_join!(metrics_server, probe_server) };

    let elector = args
        .leader_elect
        .then(|| LeaderElector::new(client.clone(), &args.leader_election_namespace, &holder_identity()));

    let workers = async {
        if let Some(elector) = &elector {
            elector.acquire().await;
        }
        tokio::spawn(ctx.hakeeper.clone().run_gc());
        readiness.mark_ready();
        let running = async {
            tokio::join!(
                controllers::logset::run(ctx.clone()),
                controllers::cnset::run(ctx.clone()),
                controllers::cnstore::run(ctx.clone()),
                async {
                    if gates.s3_reclaim {
                        controllers::bucketclaim::run(ctx.clone()).await
                    }
                },
                async {
                    if gates.cn_pool {
                        controllers::cnpool::run(ctx.clone()).await
                    }
                },
                async {
                    if gates.cn_pool {
                        controllers::cnclaim::run(ctx.clone()).await
                    }
                },
            )
        };
        let lost_lease = async {
            match &elector {
                Some(elector) => elector.hold().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = running => {
                info!("controllers stopped");
                Ok(())
            }
            _ = lost_lease => Err(anyhow::anyhow!("lost leadership")),
        }
    };

    tokio::select! {
        res = workers => res?,
        res = servers => {
            res.context("http server")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry::init(args.log_format).await;

    if let Err(e) = run(args).await {
        error!("operator failed: {e:#}");
        std::process::exit(1);
    }
}
