//! V2Ray Desktop headless controller
//!
//! Drives the same controller a desktop shell would, from the command line.

use anyhow::{bail, Context, Result};

use v2ray_desktop_lib::app::{init_app_state, AppState};
use v2ray_desktop_lib::controller::{ImportReport, ModeTransition};
use v2ray_desktop_lib::models::{LatencyOutcome, ProxyMode};

const USAGE: &str = "Usage: v2ray-desktop <command> [args]

Commands:
  run [off|global|pac|manual]   Enter a mode (default: saved mode) and run until Ctrl-C
  list                          List servers
  add <link>...                 Add servers from vmess:// or ss:// links
  add-file <path>               Import servers from a v2ray config file
  import <url>                  Import or refresh a subscription
  remove <name>                 Remove a server
  select <name>                 Select the active server
  share <name>                  Print the share link of a server
  status                        Check whether the network check urls are reachable
  system-proxy                  Show the current OS proxy setting
  reset-proxy                   Clear the OS proxy setting
  update-gfwlist [url]          Download the GFW list";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command.as_str(), "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let state = init_app_state()?;
        let result = dispatch(state, command, &args[1..]).await;
        // 退出前停止内核并清除系统代理，保存的模式保留到下次 run
        if let Err(e) = state.controller.shutdown().await {
            log::warn!("Controller shutdown failed: {}", e);
        }
        result
    })
}

async fn dispatch(state: &AppState, command: &str, args: &[String]) -> Result<()> {
    let controller = &state.controller;
    match command {
        "run" => {
            let transition = match args.first() {
                Some(mode) => controller.set_mode(mode.parse::<ProxyMode>()?).await?,
                None => controller.restore_mode().await?,
            };
            print_transition(&transition);

            if transition.mode.needs_core() {
                let mut results = controller.probe_latency(None).await?;
                while let Some(result) = results.recv().await {
                    match result.outcome {
                        LatencyOutcome::Reachable { millis } => println!("  {:<32} {} ms", result.name, millis),
                        LatencyOutcome::Unreachable => println!("  {:<32} unreachable", result.name),
                    }
                }
            }

            println!("Press Ctrl-C to stop");
            let mut events = controller.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => log::debug!("Event: {}", serde_json::to_string(&event)?),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Dropped {} controller events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            println!("Stopping...");
        }
        "list" => {
            let snapshot = controller.snapshot();
            if snapshot.servers.is_empty() {
                println!("No servers");
            }
            for server in &snapshot.servers {
                let marker = if server.connected { "*" } else { " " };
                let latency = match server.latency.as_ref().map(|l| l.outcome) {
                    Some(LatencyOutcome::Reachable { millis }) => format!("{} ms", millis),
                    Some(LatencyOutcome::Unreachable) => "unreachable".to_string(),
                    None => "-".to_string(),
                };
                println!(
                    "{} {:<32} {:<12} {}:{:<6} {}",
                    marker,
                    server.name,
                    server.protocol_name(),
                    server.address,
                    server.port,
                    latency
                );
            }
            if let Some(active) = &snapshot.active_server {
                println!("Active server: {}", active);
            }
        }
        "add" => {
            if args.is_empty() {
                bail!("add needs at least one share link");
            }
            let report = controller.add_share_links(args.join("\n")).await?;
            print_report(&report);
        }
        "add-file" => {
            let path = args.first().context("add-file needs a path")?;
            let report = controller.add_config_file(path).await?;
            print_report(&report);
        }
        "import" => {
            let url = args.first().context("import needs a subscription url")?;
            let report = controller.import_subscription(url.as_str()).await?;
            print_report(&report);
        }
        "remove" => {
            let name = args.first().context("remove needs a server name")?;
            controller.remove_server(name.as_str()).await?;
            println!("Removed {}", name);
        }
        "select" => {
            let name = args.first().context("select needs a server name")?;
            controller.set_active_server(name.as_str()).await?;
            println!("Active server: {}", name);
        }
        "share" => {
            let name = args.first().context("share needs a server name")?;
            println!("{}", controller.share_link(name)?);
        }
        "status" => {
            let status = controller.network_status().await?;
            println!("Via: {}", status.proxy.as_deref().unwrap_or("direct"));
            for check in &status.checks {
                let state = if check.accessible { "ok" } else { "unreachable" };
                println!("  {:<40} {}", check.url, state);
            }
        }
        "system-proxy" => {
            println!("{}", controller.system_proxy().await?);
        }
        "reset-proxy" => {
            controller.reset_system_proxy().await?;
            println!("System proxy cleared");
        }
        "update-gfwlist" => {
            let rules = controller.update_gfw_list(args.first().cloned()).await?;
            println!("GFW list updated: {} rules", rules);
        }
        other => bail!("unknown command `{}`\n\n{}", other, USAGE),
    }
    Ok(())
}

fn print_transition(transition: &ModeTransition) {
    println!("Mode: {}", transition.mode);
    for warning in &transition.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_report(report: &ImportReport) {
    for name in &report.added {
        println!("+ {}", name);
    }
    for name in &report.updated {
        println!("~ {}", name);
    }
    for name in &report.removed {
        println!("- {}", name);
    }
    for failure in &report.failures {
        println!("! line {}: {} ({})", failure.line, failure.reason, failure.content);
    }
}
