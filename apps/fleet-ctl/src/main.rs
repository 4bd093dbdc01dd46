//! Command-line client speaking the application protocol.

use anyhow::Context;
use clap::{Parser, Subcommand};

use fleet_appserver::{AppClient, AppServerConfig, ClientHello};

#[derive(Parser)]
#[command(name = "fleet-ctl", about = "Submit and manage fleet applications")]
struct Cli {
    /// Application server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Application server port (defaults to FLEET_SERVER_PORT or 39626)
    #[arg(long)]
    port: Option<u16>,

    /// Subject DN of the client identity
    #[arg(long)]
    subject: String,

    /// Issuer DN of the client identity
    #[arg(long, default_value = "")]
    issuer: String,

    /// Service (authorization target) to act under
    #[arg(long, default_value = "submission")]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an executable
    Submit {
        /// Application title
        title: String,

        /// Executable file; reads stdin when omitted and --exec is unset
        #[arg(long)]
        exec_file: Option<std::path::PathBuf>,

        /// Inline executable text
        #[arg(long)]
        exec: Option<String>,

        /// Arguments recorded with the application
        #[arg(long, default_value = "")]
        args: String,

        /// Ask for write access to the inventory
        #[arg(long)]
        write_request: bool,

        /// Wait for the run and stream its output
        #[arg(long)]
        synch: bool,
    },
    /// Show an application row
    Poll { appid: u64 },
    /// Abort a new or running application
    Kill { appid: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let port = cli.port.unwrap_or_else(AppServerConfig::port_from_env);
    let client = AppClient::new(
        cli.host.clone(),
        port,
        ClientHello {
            subject: cli.subject.clone(),
            issuer: cli.issuer.clone(),
        },
    );

    match cli.command {
        Command::Submit {
            title,
            exec_file,
            exec,
            args,
            write_request,
            synch,
        } => {
            let exec = match (exec, exec_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => {
                    use std::io::Read;
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("reading executable from stdin")?;
                    text
                }
            };

            if synch {
                let (ack, state) = client
                    .submit_synch(&cli.service, &title, &args, write_request, &exec)
                    .await?;
                eprintln!(
                    "Application {} finished: {} (exit code {:?})",
                    ack.appid, state.status, state.exit_code
                );
            } else {
                let ack = client
                    .submit_asynch(&cli.service, &title, &args, write_request, &exec)
                    .await?;
                println!("{}", serde_json::json!({ "appid": ack.appid, "path": ack.path }));
            }
        }
        Command::Poll { appid } => {
            let row = client.poll(&cli.service, appid).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Command::Kill { appid } => {
            let reply = client.kill(&cli.service, appid).await?;
            println!("{}", reply);
        }
    }
    Ok(())
}
