use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use metrics_exporter_prometheus::PrometheusBuilder;
use regop_core::{ApicurioRegistry, Context, InstanceRef};
use regop_engine::{CancellationToken, Controller, CycleError, CycleReport, MemoryCluster, Orchestrator};
use regop_kubehub::{KubeCluster, KubeSettings};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "regopctl", version, about = "Regop reconciliation driver")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the managed instances (default: all namespaces when listing, `default` otherwise)
    #[arg(long = "ns", env = "REGOP_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Workload container whose environment is managed
    #[arg(long = "container", env = "REGOP_CONTAINER", global = true, default_value = "registry")]
    container: String,

    /// Field manager recorded on writes
    #[arg(long = "field-manager", env = "REGOP_FIELD_MANAGER", global = true, default_value = "regop")]
    field_manager: String,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "REGOP_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile instances on a periodic resync until interrupted
    Run {
        /// Instance name (repeatable); all ApicurioRegistry objects when omitted
        #[arg(long = "name")]
        names: Vec<String>,
        /// Seconds between resyncs
        #[arg(long = "resync-secs", env = "REGOP_RESYNC_SECS", default_value_t = 30)]
        resync_secs: u64,
    },
    /// Run a single cycle for each instance
    Once {
        /// Instance name (repeatable); all ApicurioRegistry objects when omitted
        #[arg(long = "name")]
        names: Vec<String>,
    },
    /// Run cycles offline against YAML fixtures until nothing is left to write
    Simulate {
        /// ApicurioRegistry YAML
        #[arg(long = "registry")]
        registry: PathBuf,
        /// Live Deployment YAML (omit to simulate a workload that does not exist yet)
        #[arg(long = "deployment")]
        deployment: Option<PathBuf>,
        #[arg(long = "max-cycles", default_value_t = 5)]
        max_cycles: usize,
    },
}

/// `REGOP_LOG` takes the usual `EnvFilter` directives; anything unparsable falls back to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("REGOP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving Prometheus metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not installed; continuing without it"),
    }
}

fn print_outcome(output: Output, res: &Result<CycleReport, CycleError>) -> Result<()> {
    match output {
        Output::Human => match res {
            Ok(report) => {
                let drift: Vec<_> = report.units.iter().filter(|u| u.drift).map(|u| u.name).collect();
                if report.writes() == 0 {
                    println!("{} • converged", report.instance);
                } else {
                    println!("{} • drift {:?} • wrote {:?}", report.instance, drift, report.flushed);
                }
            }
            Err(e) => {
                println!("{} • failed: {}", e.instance(), e);
                if let Some(report) = e.report() {
                    for f in &report.failures {
                        println!("    {} • {}", f.target, f.message);
                    }
                }
            }
        },
        Output::Json => {
            let v = match res {
                Ok(report) => serde_json::json!({ "ok": true, "report": report }),
                Err(e) => serde_json::json!({
                    "ok": false,
                    "instance": e.instance(),
                    "error": e.to_string(),
                    "report": e.report(),
                }),
            };
            println!("{}", serde_json::to_string(&v)?);
        }
    }
    Ok(())
}

async fn resolve_instances(cluster: &KubeCluster, ns: Option<&str>, names: &[String]) -> Result<Vec<InstanceRef>> {
    if names.is_empty() {
        return cluster.list_instances(ns).await;
    }
    let ns = ns.unwrap_or("default");
    Ok(names.iter().map(|n| InstanceRef::new(ns, n.as_str())).collect())
}

async fn run_all(controller: &Controller, instances: &[InstanceRef], cancel: &CancellationToken, output: Output) -> Result<usize> {
    let runs = instances.iter().map(|i| controller.trigger(i, cancel));
    let mut failed = 0usize;
    for res in futures::future::join_all(runs).await {
        if res.is_err() {
            failed += 1;
        }
        print_outcome(output, &res)?;
    }
    Ok(failed)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing YAML in {}", path.display()))
}

async fn simulate(output: Output, registry: &Path, deployment: Option<&Path>, max_cycles: usize) -> Result<()> {
    let reg: ApicurioRegistry = read_yaml(registry)?;
    let cluster = Arc::new(MemoryCluster::new());
    let instance = cluster.put_registry(reg);
    if let Some(path) = deployment {
        let dep: Deployment = read_yaml(path)?;
        cluster.put_deployment(&instance, dep);
    }
    let mut orch = Orchestrator::new(cluster.clone(), regop_functions::default_registry()?);
    let mut ctx = Context::new(instance.clone());
    let cancel = CancellationToken::new();
    info!(instance = %instance, units = ?orch.units(), "simulating");

    for cycle in 1..=max_cycles {
        let res = orch.run_cycle(&mut ctx, &cancel).await;
        print_outcome(output, &res)?;
        match res {
            Ok(report) if report.writes() == 0 => {
                info!(cycles = cycle, "converged");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cycle failed"),
        }
    }
    warn!(max_cycles, "not converged within cycle limit");
    if output == Output::Human {
        for w in cluster.writes() {
            println!("  wrote {}", w.target);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics(cli.metrics_addr);
    let settings = KubeSettings { field_manager: cli.field_manager.clone(), container: cli.container.clone(), ..Default::default() };

    match cli.command {
        Commands::Run { names, resync_secs } => {
            let ns = cli.namespace.as_deref();
            info!(ns = ?ns, resync_secs, "run invoked");
            let cluster = Arc::new(KubeCluster::try_default(settings).await?);
            let controller = Controller::new(cluster.clone(), regop_functions::default_registry)?;
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("interrupt received; stopping after current step");
                    }
                    cancel.cancel();
                }
            });

            let mut ticker = tokio::time::interval(Duration::from_secs(resync_secs.max(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let instances = match resolve_instances(&cluster, ns, &names).await {
                            Ok(v) => v,
                            Err(e) => {
                                error!(error = ?e, "listing instances failed; retrying next resync");
                                continue;
                            }
                        };
                        for gone in controller.instances().into_iter().filter(|i| !instances.contains(i)) {
                            if controller.forget(&gone) {
                                info!(instance = %gone, "instance no longer present");
                            } else {
                                debug!(instance = %gone, "instance gone but its cycle is still running");
                            }
                        }
                        let failed = run_all(&controller, &instances, &cancel, cli.output).await?;
                        if failed > 0 {
                            warn!(failed, "some cycles failed; retrying next resync");
                        }
                    }
                }
            }
            info!("run loop stopped");
        }
        Commands::Once { names } => {
            let ns = cli.namespace.as_deref();
            let cluster = Arc::new(KubeCluster::try_default(settings).await?);
            let controller = Controller::new(cluster.clone(), regop_functions::default_registry)?;
            let instances = resolve_instances(&cluster, ns, &names).await?;
            info!(count = instances.len(), "once invoked");
            let failed = run_all(&controller, &instances, &CancellationToken::new(), cli.output).await?;
            if failed > 0 {
                anyhow::bail!("{failed} of {} cycles failed", instances.len());
            }
        }
        Commands::Simulate { registry, deployment, max_cycles } => {
            simulate(cli.output, &registry, deployment.as_deref(), max_cycles).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_addr_is_parsed_as_socket_addr() {
        let cli = Cli::try_parse_from(["regopctl", "--metrics-addr", "127.0.0.1:9184", "once"]).unwrap();
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9184".parse().unwrap()));
        assert!(Cli::try_parse_from(["regopctl", "--metrics-addr", "not-an-addr", "once"]).is_err());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["regopctl", "once", "--name", "foo", "--ns", "registry", "-o", "json"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("registry"));
        match cli.command {
            Commands::Once { names } => assert_eq!(names, vec!["foo".to_string()]),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
