use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tether_api::Mirror;
use tether_core::filter::parse_pair;
use tether_core::{ChangeEvent, EventType, Filter, WatchError, WatchTarget};
use tether_kubehub::{KubeSource, WatchItem};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch objects for a GVK and print change events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector `key=value` (`key=*` matches any value); repeatable
        #[arg(short = 'l', long = "label", value_parser = pair)]
        labels: Vec<(String, String)>,
        /// Annotation selector `key=value`; repeatable, shared watches only
        #[arg(short = 'a', long = "annotation", value_parser = pair)]
        annotations: Vec<(String, String)>,
        /// Also print bookmarks
        #[arg(long = "bookmarks", action = ArgAction::SetTrue)]
        bookmarks: bool,
        /// Dedicated watch with a server-side label selector
        #[arg(long = "direct", action = ArgAction::SetTrue)]
        direct: bool,
    },
    /// Keep a cache of a GVK until Ctrl-C, then print cache usage
    Mirror {
        gvk: String,
    },
    /// Read one object from the API server
    ///
    /// Each invocation starts with an empty cache, so there is no cached copy
    /// to fall back on; an unreachable API server is an error.
    Get {
        gvk: String,
        name: String,
    },
}

fn pair(s: &str) -> Result<(String, String), String> {
    parse_pair(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_event(output: Output, ev: &ChangeEvent) -> Result<()> {
    match output {
        Output::Human => {
            let sym = match ev.event_type {
                EventType::Added => "+",
                EventType::Modified => "~",
                EventType::Deleted => "-",
                EventType::Bookmark => "#",
                EventType::Error => "!",
            };
            let obj = &ev.object;
            match ev.event_type {
                EventType::Bookmark => println!("{} bookmark rv={}", sym, ev.resource_version),
                EventType::Error => println!("{} {}", sym, ev.message.as_deref().unwrap_or("upstream error")),
                _ if obj.namespace.is_empty() => println!("{} {} rv={}", sym, obj.name, ev.resource_version),
                _ => println!("{} {}/{} rv={}", sym, obj.namespace, obj.name, ev.resource_version),
            }
        }
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

/// Fail the command on a terminal upstream error.
fn check_terminal(ev: &ChangeEvent) -> Result<()> {
    if ev.event_type == EventType::Error {
        let msg = ev.message.clone().unwrap_or_default();
        return Err(WatchError::Upstream(msg).into());
    }
    Ok(())
}

async fn watch_shared(mirror: &Mirror, target: WatchTarget, filter: Filter, output: Output) -> Result<()> {
    let mut sub = mirror.subscribe(target, filter)?;
    let mut n = 0u64;
    loop {
        tokio::select! {
            ev = sub.recv() => match ev {
                Some(ev) => {
                    n += 1;
                    print_event(output, &ev)?;
                    check_terminal(&ev)?;
                }
                None => {
                    warn!(events = n, "subscription closed (slow consumer or shutdown)");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!(events = n, "Ctrl-C received; unsubscribing");
                break;
            }
        }
    }
    Ok(())
}

async fn watch_direct(mirror: &Mirror, target: WatchTarget, filter: &Filter, output: Output) -> Result<()> {
    let token = CancellationToken::new();
    let mut rx = mirror.watch_direct(target, filter, token.clone())?;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(WatchItem::Opened { resumed }) => {
                    info!(resumed, "watch session opened");
                }
                Some(WatchItem::Event(ev)) => {
                    if ev.event_type == EventType::Bookmark && !filter.wants_bookmarks {
                        continue;
                    }
                    print_event(output, &ev)?;
                    check_terminal(&ev)?;
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping direct watch");
                token.cancel();
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let source = KubeSource::try_default().await.context("connecting to the cluster")?;
    let mirror = Mirror::from_env(Arc::new(source));
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Watch { gvk, labels, annotations, bookmarks, direct } => {
            info!(gvk = %gvk, ns = ?ns, direct, "watch invoked");
            let mut filter = Filter::new();
            for (k, v) in labels {
                filter = filter.label(k, v);
            }
            for (k, v) in annotations {
                filter = filter.annotation(k, v);
            }
            filter = filter.bookmarks(bookmarks);
            let target = WatchTarget::new(gvk, ns);
            if direct {
                watch_direct(&mirror, target, &filter, cli.output).await?;
            } else {
                watch_shared(&mirror, target, filter, cli.output).await?;
            }
        }
        Commands::Mirror { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "mirror invoked");
            let t0 = Instant::now();
            let handle = mirror.mirror(WatchTarget::new(gvk.clone(), ns), CancellationToken::new())?;
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            handle.stop().await;
            mirror.cache().sync();
            let stats = mirror.cache().stats();
            match cli.output {
                Output::Human => println!("{}: {} entries, {} bytes", gvk, stats.entries, stats.bytes),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({ "gvk": gvk, "entries": stats.entries, "bytes": stats.bytes })
                ),
            }
            info!(took_ms = %t0.elapsed().as_millis(), "mirror stopped");
        }
        Commands::Get { gvk, name } => {
            info!(gvk = %gvk, ns = ?ns, name = %name, "get invoked");
            let read = mirror.get(&gvk, ns, &name).await?;
            match cli.output {
                Output::Human => println!("{}", serde_json::to_string_pretty(&read.record.raw)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&read)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn get_help_does_not_promise_a_cache_fallback() {
        let mut cmd = Cli::command();
        let get = cmd.find_subcommand_mut("get").map(|c| c.render_long_help().to_string()).unwrap_or_default();
        assert!(get.contains("empty cache"), "{get}");
        assert!(!get.contains("falling back"), "{get}");
    }

    #[test]
    fn watch_flags_parse() {
        let cli = Cli::try_parse_from(["tetherctl", "--ns", "prod", "watch", "v1/ConfigMap", "-l", "app=web", "--bookmarks"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        match cli.command {
            Commands::Watch { labels, bookmarks, direct, .. } => {
                assert_eq!(labels, vec![("app".to_string(), "web".to_string())]);
                assert!(bookmarks);
                assert!(!direct);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
