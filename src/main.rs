//! plugtree - inspect plugin trees from the command line

use clap::{Parser, Subcommand};
use plugtree_core::{Args, HubConfig};
use plugtree_hub::{Function, Hub, Library, NodeId, NodeSpec, Resolved, ROOT};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "plugtree", about = "Hierarchical plugin namespaces with lazy loading")]
struct Cli {
    /// Hub configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra search path for code roots (repeatable)
    #[arg(short = 'p', long = "search-path", global = true)]
    search_paths: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List dynamic namespaces found under the search paths
    Dynes {
        #[arg(long)]
        json: bool,
    },
    /// Load dynes and extra nodes, then print the namespace tree
    Tree {
        /// Extra node as NAME=DIR (repeatable)
        #[arg(short, long = "node")]
        nodes: Vec<String>,
        /// Only show this subtree
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Resolve a dotted path and print what it names; functions are called
    Get {
        path: String,
        /// Extra node as NAME=DIR (repeatable)
        #[arg(short, long = "node")]
        nodes: Vec<String>,
        /// Positional JSON arguments when the path is a function
        args: Vec<String>,
    },
    /// Print the effective configuration
    Config,
    /// Show version
    Version,
}

/// Native symbols available to units loaded by the binary.
fn builtins() -> Library {
    let lib = Library::new();
    lib.register_value("plugtree::version", env!("CARGO_PKG_VERSION"))
        .register_value("plugtree::os", std::env::consts::OS)
        .register_fn(
            "plugtree::echo",
            Function::new_async("echo", |call| async move { Ok(json!(call.args().positional)) }),
        )
        .register_fn(
            "plugtree::unix_only",
            Function::blocking("unix_only", |_| {
                Ok(if cfg!(unix) {
                    json!(true)
                } else {
                    json!([false, "requires a unix host"])
                })
            }),
        );
    lib
}

fn load_config(cli: &Cli) -> HubConfig {
    let mut config = cli.config.as_deref().map(HubConfig::load).unwrap_or_default();
    config.search_paths.extend(cli.search_paths.iter().cloned());
    config
}

fn build_hub(cli: &Cli) -> Hub {
    Hub::with_config(builtins(), load_config(cli))
}

fn add_nodes(hub: &Hub, nodes: &[String]) -> anyhow::Result<Vec<NodeId>> {
    nodes
        .iter()
        .map(|entry| {
            let (name, dir) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected NAME=DIR, got '{}'", entry))?;
            Ok(hub.add_node(NodeSpec::new(name).location(PathBuf::from(dir)))?)
        })
        .collect()
}

fn print_tree(hub: &Hub, node: NodeId, depth: usize) {
    let Some(info) = hub.node_info(node) else {
        return;
    };
    let indent = "  ".repeat(depth);
    if node != ROOT {
        let marker = if info.active { "" } else { " (inactive)" };
        println!("{}{}/{}", indent, info.name, marker);
    }
    for unit in &info.units {
        println!("{}  {}", indent, unit);
    }
    for (unit, reason) in &info.load_errors {
        println!("{}  !{}: {}", indent, unit, reason.lines().next().unwrap_or_default());
    }
    for child in hub.iter_nodes(node, false) {
        print_tree(hub, child, depth + 1);
    }
}

fn tree_json(hub: &Hub, node: NodeId) -> serde_json::Value {
    let Some(info) = hub.node_info(node) else {
        return serde_json::Value::Null;
    };
    let children: Vec<_> = hub.iter_nodes(node, false).into_iter().map(|c| tree_json(hub, c)).collect();
    json!({
        "name": info.name,
        "reference": info.reference,
        "active": info.active,
        "dirs": info.dirs,
        "units": info.units,
        "load_errors": info.load_errors,
        "children": children,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plugtree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Dynes { json } => {
            let hub = build_hub(&cli);
            let manifest = hub.dynamic();
            if *json {
                println!("{}", serde_json::to_string_pretty(&manifest.dyne)?);
            } else {
                for (name, dirs) in &manifest.dyne {
                    println!("{}", name);
                    for dir in dirs {
                        println!("  {}", dir.display());
                    }
                }
            }
        }

        Commands::Tree { nodes, root, json } => {
            let hub = build_hub(&cli);
            let dynes = hub.load_dynes().await?;
            tracing::info!("Loaded {} dynes", dynes.len());
            for id in add_nodes(&hub, nodes)? {
                hub.load_subdirs(id, true)?;
                hub.load_all_recursive(id).await?;
            }
            let start = match root {
                Some(path) => hub
                    .node(path)
                    .ok_or_else(|| anyhow::anyhow!("no node named '{}'", path))?,
                None => ROOT,
            };
            if *json {
                println!("{}", serde_json::to_string_pretty(&tree_json(&hub, start))?);
            } else {
                print_tree(&hub, start, 0);
            }
        }

        Commands::Get { path, nodes, args } => {
            let hub = build_hub(&cli);
            hub.load_dynes().await?;
            add_nodes(&hub, nodes)?;
            match hub.resolve(path).await? {
                Resolved::Function(function) => {
                    let args = args
                        .iter()
                        .map(|a| serde_json::from_str(a).unwrap_or_else(|_| json!(a)))
                        .fold(Args::new(), |acc, v: serde_json::Value| acc.arg(v));
                    let out = function.call(&hub, args).await?;
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                Resolved::Variable(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Resolved::Class(class) => println!("class {} ({})", class.name, class.fields.join(", ")),
                Resolved::Unit(unit) => {
                    println!("unit {}", unit.reference());
                    for name in unit.names() {
                        println!("  {}", name);
                    }
                }
                Resolved::Node(id) => print_tree(&hub, id, 0),
            }
        }

        Commands::Config => print!("{}", load_config(&cli).to_toml()),

        Commands::Version => {
            println!("plugtree v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Hub {
        Hub::with_config(
            builtins(),
            HubConfig {
                include_cwd: false,
                ..Default::default()
            },
        )
    }

    #[test]
    fn node_arguments_need_a_directory() {
        let hub = hub();
        assert!(add_nodes(&hub, &["broken".to_string()]).is_err());
        let dir = tempfile::tempdir().unwrap();
        let ids = add_nodes(&hub, &[format!("tools={}", dir.path().display())]).unwrap();
        assert_eq!(hub.reference(ids[0]), "tools");
        assert_eq!(hub.node_info(ids[0]).unwrap().dirs, vec![dir.path().to_path_buf()]);
    }

    #[tokio::test]
    async fn builtins_back_plugin_units() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("info.toml"),
            "virtual = \"plugtree::unix_only\"\n[exports]\nversion = \"plugtree::version\"\necho = \"plugtree::echo\"\n",
        )
        .unwrap();
        let hub = hub();
        add_nodes(&hub, &[format!("sys={}", dir.path().display())]).unwrap();
        if cfg!(unix) {
            let echoed = hub.call("sys.info.echo", Args::new().arg(1).arg("a")).await.unwrap();
            assert_eq!(echoed, json!([1, "a"]));
            assert!(matches!(hub.resolve("sys.info.version").await, Ok(Resolved::Variable(_))));
        }
    }
}
