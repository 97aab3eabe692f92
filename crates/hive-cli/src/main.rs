#![forbid(unsafe_code)]

//! **hive-cli** – Command-line client for the hive control plane.
//!
//! A thin wrapper over the HTTP API with conventional exit codes:
//! 0 success, 2 validation, 3 permission, 4 not-found, 5 busy, 1 internal.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "hive - drive the agent fleet from the terminal")]
#[command(version)]
struct Cli {
    /// API base URL
    #[arg(long, env = "HIVE_API_URL", default_value = "http://127.0.0.1:8090")]
    api_url: String,

    /// API key
    #[arg(long, env = "HIVE_API_KEY")]
    api_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List agents visible to the caller
    Agents {
        /// Include orphaned agents (admin only)
        #[arg(long)]
        orphans: bool,
    },
    /// Create an agent
    Create {
        /// Agent name
        name: String,
        /// Template to create from
        #[arg(long, default_value = "default")]
        template: String,
        /// Start the container immediately
        #[arg(long)]
        start: bool,
    },
    /// Delete an agent
    Delete {
        /// Agent name
        name: String,
    },
    /// Start an agent
    Start {
        /// Agent name
        name: String,
    },
    /// Stop an agent
    Stop {
        /// Agent name
        name: String,
    },
    /// Sequential chat with an agent
    Chat {
        /// Agent name
        name: String,
        /// Message to send
        message: String,
    },
    /// Run a stateless task on an agent
    Task {
        /// Agent name
        name: String,
        /// Message to send
        message: String,
        /// Fire-and-forget; poll the returned execution id
        #[arg(long = "async")]
        fire_and_forget: bool,
    },
    /// Show one execution
    Execution {
        /// Agent name
        name: String,
        /// Durable execution id
        id: i64,
    },
    /// Terminate a running execution
    Terminate {
        /// Agent name
        name: String,
        /// Durable execution id
        id: i64,
    },
    /// List an agent's schedules
    Schedules {
        /// Agent name
        name: String,
    },
    /// Busy agents (held queue slots)
    Busy,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let http = reqwest::Client::new();
    let base = cli.api_url.trim_end_matches('/');

    let response = match &cli.command {
        Command::Agents { orphans } => {
            let url = format!("{base}/agents?orphans={orphans}");
            http.get(url).bearer_auth(&cli.api_key).send().await?
        }
        Command::Create { name, template, start } => {
            let body = json!({ "name": name, "template": template, "auto_start": start });
            http.post(format!("{base}/agents"))
                .bearer_auth(&cli.api_key)
                .json(&body)
                .send()
                .await?
        }
        Command::Delete { name } => {
            http.delete(format!("{base}/agents/{name}"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Start { name } => {
            http.post(format!("{base}/agents/{name}/start"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Stop { name } => {
            http.post(format!("{base}/agents/{name}/stop"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Chat { name, message } => {
            http.post(format!("{base}/agents/{name}/chat"))
                .bearer_auth(&cli.api_key)
                .json(&json!({ "message": message }))
                .send()
                .await?
        }
        Command::Task { name, message, fire_and_forget } => {
            http.post(format!("{base}/agents/{name}/task"))
                .bearer_auth(&cli.api_key)
                .json(&json!({ "message": message, "async": fire_and_forget }))
                .send()
                .await?
        }
        Command::Execution { name, id } => {
            http.get(format!("{base}/agents/{name}/executions/{id}"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Terminate { name, id } => {
            http.post(format!("{base}/agents/{name}/executions/{id}/terminate"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Schedules { name } => {
            http.get(format!("{base}/agents/{name}/schedules"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
        Command::Busy => {
            http.get(format!("{base}/agents/busy"))
                .bearer_auth(&cli.api_key)
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: Option<Value> = response.json().await.ok();
    if let Some(body) = &body {
        println!("{}", serde_json::to_string_pretty(body)?);
    }

    Ok(exit_code(status, body.as_ref()))
}

/// Map the response onto the conventional exit codes.
fn exit_code(status: StatusCode, body: Option<&Value>) -> ExitCode {
    if status.is_success() {
        return ExitCode::SUCCESS;
    }
    let kind = body
        .and_then(|b| b.get("error"))
        .and_then(|k| k.as_str())
        .unwrap_or("internal");
    let code = match (status, kind) {
        (StatusCode::BAD_REQUEST, _) => 2,
        (StatusCode::FORBIDDEN, _) => 3,
        (StatusCode::NOT_FOUND, _) => 4,
        (_, "busy") => 5,
        _ => 1,
    };
    ExitCode::from(code)
}
