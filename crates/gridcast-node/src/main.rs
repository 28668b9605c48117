//! gridcast node binary entry point.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use gridcast_core::watcher::WatcherConfig;
use gridcast_node::node::{Node, NodeConfig};
use gridcast_node::status::Role;
use gridcast_node::Cli;

fn main() {
    let cli = Cli::parse();

    // Base level is info; -v steps up to debug, -vv to trace.
    let log_format = cli.log_format.into();
    let verbosity = cli.verbose.saturating_add(2);
    if let Err(e) = gridcast_core::init_logging(verbosity, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "gridcast-node starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(%e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let config = NodeConfig {
        project_dir: cli.project_dir(),
        presence_port: cli.presence_port,
        initial_role: if cli.master { Role::Master } else { Role::Peer },
        watcher: WatcherConfig::default(),
    };

    let mut node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            // Startup is the only fatal window: cannot bind, cannot create
            // the project tree.
            error!(%e, "node failed to start");
            return 1;
        }
    };

    info!(
        id = %node.id(),
        endpoint = %node.endpoint(),
        role = ?node.role(),
        "node running; commands: m=master p=peer s=save-mapping q=quit"
    );

    // Drain renderer-facing events into the log (no renderer attached).
    if let Some(mut app_events) = node.take_app_events() {
        tokio::spawn(async move {
            while let Some(event) = app_events.recv().await {
                info!(?event, "app event");
            }
        });
    }

    if cli.headless {
        let _ = tokio::signal::ctrl_c().await;
    } else {
        run_command_loop(&node).await;
    }

    node.shutdown().await;
    0
}

/// Stdin command loop, standing in for the renderer's key handling.
async fn run_command_loop(node: &Node) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            // Stdin closed (piped input ran out): wait for ctrl-c.
            Ok(None) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
            Err(e) => {
                warn!(%e, "stdin read failed");
                return;
            }
        };

        match line.trim() {
            "m" => {
                node.set_role(Role::Master);
                if let Err(e) = node.broadcast_structure().await {
                    warn!(%e, "structure broadcast failed");
                }
            }
            "p" => node.set_role(Role::Peer),
            "s" => match node.save_mapping() {
                Ok(()) => info!("mapping saved"),
                Err(e) => warn!(%e, "mapping save failed"),
            },
            "q" => return,
            "" => {}
            other => warn!(command = other, "unknown command (m/p/s/q)"),
        }
    }
}
