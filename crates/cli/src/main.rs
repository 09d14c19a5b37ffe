use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kanav_api::{Navigator, ResolvedAction};
use kanav_core::Settings;
use kanav_hierarchy::MergedDocument;
use kanav_kubehub::MemoryCluster;
use kanav_ops::CommandOutcome;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "kanavctl", version, about = "Actions and status mappings for Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Serve reads from the YAML/JSON manifests in this directory instead of a live cluster
    #[arg(long = "offline", global = true, value_name = "DIR")]
    offline: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct SettingsArgs {
    /// Namespace holding kind-level, global and unregistered config maps
    #[arg(long = "namespace", env = "KANAV_NAMESPACE", global = true)]
    namespace: Option<String>,
    #[arg(long = "actions-prefix", env = "KANAV_ACTIONS_PREFIX", global = true)]
    actions_prefix: Option<String>,
    #[arg(long = "status-prefix", env = "KANAV_STATUS_PREFIX", global = true)]
    status_prefix: Option<String>,
    /// Base URL served as ${builtin.nav-url}
    #[arg(long = "nav-url", env = "KANAV_NAV_URL", global = true)]
    nav_url: Option<String>,
    #[arg(long = "cmd-timeout-secs", env = "KANAV_CMD_TIMEOUT_SECS", global = true)]
    cmd_timeout_secs: Option<u64>,
    #[arg(long = "kubectl", env = "KANAV_KUBECTL", global = true)]
    kubectl: Option<String>,
    /// Operation budget per snippet call; zero is rejected
    #[arg(long = "snippet-max-ops", env = "KANAV_SNIPPET_MAX_OPS", global = true, value_parser = clap::value_parser!(u64).range(1..))]
    snippet_max_ops: Option<u64>,
    #[arg(long = "watch-backoff-secs", env = "KANAV_WATCH_BACKOFF_SECS", global = true)]
    watch_backoff_secs: Option<u64>,
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        let d = Settings::default();
        Settings {
            namespace: self.namespace.unwrap_or(d.namespace),
            actions_prefix: self.actions_prefix.unwrap_or(d.actions_prefix),
            status_prefix: self.status_prefix.unwrap_or(d.status_prefix),
            nav_url: self.nav_url.unwrap_or(d.nav_url),
            command_timeout: self.cmd_timeout_secs.map(Duration::from_secs).unwrap_or(d.command_timeout),
            kubectl: self.kubectl.unwrap_or(d.kubectl),
            snippet_max_ops: self.snippet_max_ops.unwrap_or(d.snippet_max_ops),
            watch_backoff: self.watch_backoff_secs.map(Duration::from_secs).unwrap_or(d.watch_backoff),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Config maps selected by KindActionMapping rules
    Maps {
        /// Resource manifest (YAML or JSON), `-` for stdin
        resource: String,
    },
    /// Merged action document
    Actions {
        resource: String,
    },
    /// Merged status document
    Status {
        resource: String,
    },
    /// Resolve one pattern against a resource and its action document
    Resolve {
        resource: String,
        /// Pattern text, e.g. '${resource.metadata.name}'
        pattern: String,
    },
    /// Resolve a named action
    Action {
        resource: String,
        /// url-actions, cmd-actions or function-actions
        category: String,
        name: String,
        /// User input as field=value, repeatable
        #[arg(long = "input", value_name = "FIELD=VALUE")]
        inputs: Vec<String>,
        /// Run the resolved command of a cmd action
        #[arg(long = "run", action = ArgAction::SetTrue)]
        run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KANAV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KANAV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KANAV_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_resource(path: &str) -> Result<Json> {
    let text = if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading resource from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    let resource: Json = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path))?;
    if !resource.is_object() {
        bail!("{}: expected a single resource object", path);
    }
    Ok(resource)
}

/// `field=value`; numbers and booleans keep their type.
fn parse_inputs(pairs: &[String]) -> Result<Map<String, Json>> {
    let mut out = Map::new();
    for pair in pairs {
        let (field, raw) = pair.split_once('=').ok_or_else(|| anyhow!("invalid --input {:?}; expected FIELD=VALUE", pair))?;
        let value = match serde_json::from_str::<Json>(raw) {
            Ok(v @ (Json::Number(_) | Json::Bool(_))) => v,
            _ => Json::String(raw.to_string()),
        };
        out.insert(field.to_string(), value);
    }
    Ok(out)
}

async fn navigator(offline: Option<&Path>, settings: Settings) -> Result<Navigator> {
    match offline {
        Some(dir) => {
            let cluster = MemoryCluster::load_dir(dir)?;
            info!(dir = %dir.display(), "offline mode");
            Ok(Navigator::new(settings, Arc::new(cluster)))
        }
        None => Navigator::connect(settings).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_document(doc: &MergedDocument, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            doc.sources.iter().for_each(|s| println!("# {}", s));
            print!("{}", serde_yaml::to_string(&doc.body)?);
            Ok(())
        }
        Output::Json => print_json(doc),
    }
}

fn print_action(action: &ResolvedAction) {
    println!("{} {}", action.category, action.name);
    for (key, value) in &action.fields {
        let mark = if action.unresolved.contains(key) { " (unresolved)" } else { "" };
        println!("  {:<16} {}{}", key, value, mark);
    }
    if let Some(argv) = &action.argv {
        println!("  argv             {:?}", argv);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let nav = navigator(cli.offline.as_deref(), cli.settings.into_settings()).await?;
    debug!(settings = ?nav.settings(), "navigator ready");

    match cli.command {
        Commands::Maps { resource } => {
            let ids = nav.config_maps_for(&load_resource(&resource)?).await?;
            match cli.output {
                Output::Human => ids.iter().for_each(|id| println!("{}", id)),
                Output::Json => print_json(&ids)?,
            }
        }
        Commands::Actions { resource } => {
            let doc = nav.action_document(&load_resource(&resource)?).await?;
            print_document(&doc, cli.output)?;
        }
        Commands::Status { resource } => {
            let doc = nav.status_document(&load_resource(&resource)?).await?;
            print_document(&doc, cli.output)?;
        }
        Commands::Resolve { resource, pattern } => {
            let resource = load_resource(&resource)?;
            let doc = nav.action_document(&resource).await?;
            let rv = nav.resolve(&resource, &doc, &pattern).await?;
            match cli.output {
                Output::Human => {
                    println!("{}", rv.text);
                    if !rv.fully_resolved { eprintln!("warning: pattern not fully resolved"); }
                }
                Output::Json => print_json(&rv)?,
            }
        }
        Commands::Action { resource, category, name, inputs, run } => {
            let inputs = parse_inputs(&inputs)?;
            let action = nav.resolve_action(&load_resource(&resource)?, &category, &name, &inputs).await?;
            match cli.output {
                Output::Human => print_action(&action),
                Output::Json => print_json(&action)?,
            }
            if run {
                let Some(argv) = &action.argv else {
                    bail!("{} {} has no fully resolved command to run", category, name);
                };
                let outcome = nav.env().commands.run(argv).await;
                match (&outcome, cli.output) {
                    (_, Output::Json) => print_json(&outcome)?,
                    (CommandOutcome::Completed { stdout }, Output::Human) => print!("{}", stdout),
                    (_, Output::Human) => {}
                }
                outcome.into_result()?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_keep_scalar_types() {
        let inputs = parse_inputs(&["replicas=3".into(), "force=true".into(), "reason=a=b".into(), "tag=v1".into()]).unwrap();
        assert_eq!(inputs["replicas"], Json::from(3));
        assert_eq!(inputs["force"], Json::Bool(true));
        assert_eq!(inputs["reason"], Json::String("a=b".into()));
        assert_eq!(inputs["tag"], Json::String("v1".into()));
        assert!(parse_inputs(&["novalue".into()]).is_err());
    }

    #[test]
    fn cli_parses_action_with_inputs() {
        let cli = Cli::try_parse_from([
            "kanavctl", "--offline", "manifests", "-o", "json", "action", "deploy.yaml", "cmd-actions", "scale", "--input", "replicas=2", "--run",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.offline.as_deref(), Some(Path::new("manifests")));
        match cli.command {
            Commands::Action { category, inputs, run, .. } => {
                assert_eq!(category, "cmd-actions");
                assert_eq!(inputs, vec!["replicas=2".to_string()]);
                assert!(run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn zero_snippet_budget_is_rejected() {
        assert!(Cli::try_parse_from(["kanavctl", "--snippet-max-ops", "0", "maps", "r.yaml"]).is_err());
        let cli = Cli::try_parse_from(["kanavctl", "--snippet-max-ops", "50", "maps", "r.yaml"]).unwrap();
        assert_eq!(cli.settings.into_settings().snippet_max_ops, 50);
    }
}
