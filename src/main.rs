use anyhow::Context;
use clap::{Parser, Subcommand};
use refresher::app::RefresherApp;
use refresher::config::RefresherConfig;
use refresher::producer::EnqueueOutcome;
use refresher::telemetry;
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "refresher", version, about = "Entity refresh queue tooling")]
struct Cli {
    /// Configuration file layered over `config/local.*` and under `REFRESHER__*` variables.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Declare every configured queue, its delay queue and the dead queue.
    Declare,
    /// Request a refresh of one entity.
    Enqueue {
        /// Entity kind; also the name of the queue the request goes to.
        kind: String,
        id: String,
        /// JSON payload. Defaults to `{"id": <id>}`.
        #[arg(long)]
        payload: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    let cli = Cli::parse();
    let config =
        RefresherConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Config => {
            let rendered =
                serde_json::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Declare => {
            let app = RefresherApp::initialise(config)
                .await
                .context("failed to declare queues")?;
            let names: Vec<String> = app.topology().names().map(str::to_string).collect();
            println!(
                "declared {} queue(s) plus delay queues and `{}`: {}",
                names.len(),
                app.config().dead_queue,
                names.join(", ")
            );
            app.close().await;
            Ok(())
        }
        Command::Enqueue { kind, id, payload } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str::<JsonValue>(&raw)
                    .with_context(|| format!("payload is not valid JSON: {raw}"))?,
                None => default_payload(&id),
            };

            let app = RefresherApp::initialise(config)
                .await
                .context("failed to construct application")?;
            let outcome = app
                .producer()
                .enqueue(&kind, &id, &payload)
                .await
                .with_context(|| format!("failed to enqueue {kind}:{id}"));
            app.close().await;

            let outcome: EnqueueOutcome = outcome?;
            println!("{kind}:{id} {outcome}");
            Ok(())
        }
    }
}

fn default_payload(id: &str) -> JsonValue {
    match id.parse::<u64>() {
        Ok(numeric) => json!({ "id": numeric }),
        Err(_) => json!({ "id": id }),
    }
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
    fn enqueue_accepts_global_config_after_subcommand() {
        let cli = Cli::try_parse_from([
            "refresher", "enqueue", "app", "440", "--payload", r#"{"app_id":440}"#, "--config",
            "refresher.toml",
        ])
        .expect("parse");

        assert_eq!(cli.config, Some(PathBuf::from("refresher.toml")));
        assert!(matches!(
            cli.command,
            Command::Enqueue { ref kind, ref id, payload: Some(_) } if kind == "app" && id == "440"
        ));
    }

    #[test]
    fn default_payload_prefers_numeric_ids() {
        assert_eq!(default_payload("440"), json!({ "id": 440 }));
        assert_eq!(default_payload("abc"), json!({ "id": "abc" }));
    }
}
