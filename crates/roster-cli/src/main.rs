use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use roster_core::loopback::LoopbackClient;
use roster_core::{
    Connection, CredentialsService, EventListeners, RosterConfig, SessionEvent, SessionManager,
    Stream, StreamRecord, StreamRole,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "roster-cli")]
#[command(about = "Run a scripted session against the loopback client and print its state", long_about = None)]
struct Args {
    /// JSON config file with credentials and media defaults
    #[arg(long, env = "ROSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Credentials endpoint, used when no config file is given
    #[arg(long, env = "ROSTER_ENDPOINT")]
    endpoint: Option<String>,

    /// Room to request credentials for
    #[arg(long, env = "ROSTER_ROOM")]
    room: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster_core=info,roster_cli=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    let client = LoopbackClient::new();
    let manager = SessionManager::new(Arc::new(client.clone()), config.credentials.clone());

    let listeners = EventListeners::new()
        .on("streamCreated", |_, event| {
            if let SessionEvent::StreamCreated(stream) = event {
                info!(stream_id = %stream.stream_id, role = %stream.role, "remote stream available");
            }
        })
        .on("signal", |m, event| {
            if let SessionEvent::Signal { kind, data, from } = event {
                let own = from.as_ref().is_some_and(|c| m.is_me(c));
                info!(%kind, %data, own, "signal received");
            }
        });
    manager.connect(Some(listeners)).await?;

    let publisher = manager
        .publish("local-camera", &config.publisher, None, false)
        .await?;
    info!(publisher_id = %publisher.id(), "publishing");

    let session = client
        .session()
        .context("loopback client has no session")?;
    let remote = Stream::new(
        "remote-camera",
        StreamRole::Camera,
        Connection::new("remote-participant"),
    );
    session.add_remote_stream(remote.clone());
    session.add_remote_record(serde_json::from_value::<StreamRecord>(serde_json::json!({
        "streamId": "remote-screen",
        "videoType": "screen",
        "connection": { "connectionId": "remote-participant" },
    }))?);

    manager
        .subscribe(&remote, "remote-video", &config.subscriber, None)
        .await?;
    manager
        .signal("greeting", &serde_json::json!({ "text": "hello" }), None)
        .await?;

    println!("{}", serde_json::to_string_pretty(&manager.state())?);

    manager.disconnect();
    Ok(())
}

async fn load_config(args: &Args) -> Result<RosterConfig> {
    if let Some(path) = &args.config {
        return RosterConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    match (&args.endpoint, &args.room) {
        (Some(endpoint), Some(room)) => {
            let credentials = CredentialsService::request(endpoint, room)
                .await
                .with_context(|| format!("requesting credentials for room '{room}'"))?;
            Ok(RosterConfig::new(credentials))
        }
        _ => bail!("either --config or both --endpoint and --room are required"),
    }
}
