// ctl/src/main.rs — acdqctl: management CLI for the ACD queue engine

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use acdq_engine::api;
use acdq_engine::persistence::JsonFileStore;
use acdq_engine::store::NoRealtime;
use acdq_engine::Engine;

#[derive(Parser)]
#[command(
    name = "acdqctl",
    version,
    author,
    about = "acdqctl — management interface for the ACD queue and dispatch core"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the queue config file.
    #[arg(long, default_value = "acdq.toml")]
    config: PathBuf,

    /// Path to the dynamic-member persistence file.
    #[arg(long, default_value = "acdq-members.json")]
    persistence: PathBuf,

    /// Emit JSON instead of plain text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a dynamic member to a queue.
    AddMember {
        queue: String,
        iface: String,
        #[arg(default_value_t = 0)]
        penalty: u32,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        paused: bool,
    },
    /// Remove a member (dynamic or static) from a queue.
    RemoveMember { queue: String, iface: String },
    /// Pause a member, optionally scoped to one queue.
    Pause {
        iface: String,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Unpause a member, optionally scoped to one queue.
    Unpause {
        iface: String,
        #[arg(long)]
        queue: Option<String>,
    },
    /// Show a queue's waiting count, counters, and member list.
    Show { queue: String },
    /// Write a structured queue-log line.
    QueueLog {
        queue: String,
        uniqueid: String,
        agent: String,
        event: String,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let text = fs::read_to_string(&cli.config).unwrap_or_default();
    let file_config = match acdq_engine::config::parse(&text) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to parse {}: {e}", cli.config.display());
            std::process::exit(1)
        }
    };

    let persistence_store: Arc<dyn acdq_engine::persistence::PersistenceStore> = match JsonFileStore::open(&cli.persistence) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to open persistence file {}: {e}", cli.persistence.display());
            std::process::exit(1)
        }
    };
    let engine = Engine::start_with_persistence(&file_config, &NoRealtime, persistence_store);

    run(&engine, cli.command, cli.json);

    engine.shutdown();
}

fn run(engine: &Engine, command: Commands, json_out: bool) {
    match command {
        Commands::AddMember { queue, iface, penalty, name, paused } => {
            let status = api::add_member(&engine.store, &engine.iface_index, engine.persistence.as_deref(), &queue, &iface, &name, penalty, paused, true);
            print_status(json_out, "AQMSTATUS", &format!("{status:?}"));
        }
        Commands::RemoveMember { queue, iface } => {
            let status = api::remove_member(&engine.store, &engine.iface_index, engine.persistence.as_deref(), &queue, &iface);
            print_status(json_out, "RQMSTATUS", &format!("{status:?}"));
        }
        Commands::Pause { iface, queue, reason } => {
            let count = api::set_paused(&engine.store, engine.persistence.as_deref(), queue.as_deref(), &iface, reason, true);
            print_status(json_out, "PQMSTATUS", if count > 0 { "PAUSED" } else { "NOTFOUND" });
        }
        Commands::Unpause { iface, queue } => {
            let count = api::set_paused(&engine.store, engine.persistence.as_deref(), queue.as_deref(), &iface, None, false);
            print_status(json_out, "UPQMSTATUS", if count > 0 { "UNPAUSED" } else { "NOTFOUND" });
        }
        Commands::Show { queue } => show_queue(engine, &queue, json_out),
        Commands::QueueLog { queue, uniqueid, agent, event } => {
            eprintln!("queue-log lines are written by the engine at defined transitions; manual injection for '{event}' on '{queue}'/'{uniqueid}'/'{agent}' is not a supported operator action.");
            std::process::exit(2);
        }
    }
}

fn print_status(json_out: bool, field: &str, value: &str) {
    if json_out {
        println!("{}", json!({ field: value }));
    } else {
        println!("{field}={value}");
    }
}

fn show_queue(engine: &Engine, queue: &str, json_out: bool) {
    let Some(vars) = api::variables_snapshot(&engine.store, queue) else {
        eprintln!("no such queue: {queue}");
        std::process::exit(1);
    };
    let members = api::member_list(&engine.store, queue).unwrap_or_default();

    if json_out {
        let member_rows: Vec<_> = members
            .iter()
            .map(|m| json!({
                "iface": m.iface,
                "name": m.name,
                "penalty": m.penalty,
                "paused": m.paused,
                "dynamic": m.dynamic,
                "calls_taken": m.calls_taken,
                "device_state": format!("{:?}", m.device_state),
            }))
            .collect();
        println!(
            "{}",
            json!({
                "queue": queue,
                "waiting": vars.waiting,
                "completed": vars.completed,
                "abandoned": vars.abandoned,
                "completed_in_sl": vars.completed_in_sl,
                "avg_holdtime_secs": vars.avg_holdtime_secs,
                "members": member_rows,
            })
        );
    } else {
        println!(
            "{queue}: waiting={} completed={} abandoned={} completed_in_sl={} avg_holdtime={}s",
            vars.waiting, vars.completed, vars.abandoned, vars.completed_in_sl, vars.avg_holdtime_secs
        );
        for m in &members {
            println!(
                "  {} {} penalty={} paused={} dynamic={} calls={} state={:?}",
                m.iface, m.name, m.penalty, m.paused, m.dynamic, m.calls_taken, m.device_state
            );
        }
    }
}
