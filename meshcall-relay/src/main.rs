//! Meshcall relay CLI

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshcall_core::prelude::*;
use meshcall_core::RegistryConfig;
use meshcall_relay::auth::parse_token_spec;
use meshcall_relay::{
    serve, BearerTokenResolver, ClientAuth, HttpSignalingChannel, IdentityResolver, RelayConfig,
    TrustedHeaderResolver,
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Serve {
        /// Address to listen on
        #[arg(long, env = "MESHCALL_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Age in seconds after which a call is purged
        #[arg(long, default_value_t = 86_400)]
        session_ttl_secs: u64,

        /// Seconds between expiry sweeps
        #[arg(long, default_value_t = 3_600)]
        sweep_interval_secs: u64,

        /// Bearer token as <participant>=<secret>; repeatable. Without any,
        /// callers are identified by the x-participant-id header.
        #[arg(long = "token", value_name = "PARTICIPANT=SECRET")]
        tokens: Vec<String>,
    },

    /// Print the participants and messages of a call
    Fetch {
        #[command(flatten)]
        client: ClientArgs,

        /// Call to read
        #[arg(long)]
        call_id: String,

        /// Only messages newer than this timestamp (ms)
        #[arg(long)]
        since: Option<i64>,
    },

    /// Join a call with the loopback media backend and print call events
    Join {
        #[command(flatten)]
        client: ClientArgs,

        /// Call to join
        #[arg(long)]
        call_id: String,

        /// Offer to everyone present and to later joiners
        #[arg(long)]
        initiator: bool,

        /// Join without video
        #[arg(long)]
        audio_only: bool,

        /// Leave after this many seconds; runs until Ctrl-C otherwise
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

#[derive(Args)]
struct ClientArgs {
    /// Relay base URL
    #[arg(long, env = "MESHCALL_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Participant id; a random one is generated when omitted
    #[arg(long, env = "MESHCALL_IDENTITY")]
    identity: Option<String>,

    /// Bearer token; the trusted participant header is used when omitted
    #[arg(long, env = "MESHCALL_TOKEN")]
    token: Option<String>,
}

impl ClientArgs {
    fn channel(self) -> Result<HttpSignalingChannel> {
        let identity = self.identity.unwrap_or_else(generate_random_identity);
        let participant = ParticipantId::parse(identity).context("invalid identity")?;
        let auth = match self.token {
            Some(token) => ClientAuth::Bearer(token),
            None => ClientAuth::TrustedHeader,
        };
        Ok(HttpSignalingChannel::new(self.server, participant, auth)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meshcall=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            session_ttl_secs,
            sweep_interval_secs,
            tokens,
        } => {
            let config = RelayConfig {
                bind_addr: bind,
                registry: RegistryConfig {
                    session_ttl: Duration::from_secs(session_ttl_secs),
                    sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
                },
            };
            handle_serve(config, &tokens).await?;
        }
        Commands::Fetch {
            client,
            call_id,
            since,
        } => {
            handle_fetch(client, &call_id, since).await?;
        }
        Commands::Join {
            client,
            call_id,
            initiator,
            audio_only,
            duration_secs,
        } => {
            let media = if audio_only {
                MediaConstraints::audio_only()
            } else {
                MediaConstraints::video_call()
            };
            handle_join(client, &call_id, initiator, media, duration_secs).await?;
        }
    }

    Ok(())
}

async fn handle_serve(config: RelayConfig, tokens: &[String]) -> Result<()> {
    let resolver: Arc<dyn IdentityResolver> = if tokens.is_empty() {
        tracing::warn!("No tokens configured, trusting the x-participant-id header");
        Arc::new(TrustedHeaderResolver::default())
    } else {
        let resolver = tokens
            .iter()
            .map(|spec| parse_token_spec(spec))
            .collect::<Result<BearerTokenResolver, _>>()?;
        tracing::info!(tokens = resolver.len(), "Bearer token authentication enabled");
        Arc::new(resolver)
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        on_signal.cancel();
    });

    serve(config, resolver, shutdown).await?;
    Ok(())
}

async fn handle_fetch(client: ClientArgs, call_id: &str, since: Option<i64>) -> Result<()> {
    let channel = client.channel()?;
    let call_id = CallId::parse(call_id)?;
    let snapshot = channel.fetch(&call_id, since).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn handle_join(
    client: ClientArgs,
    call_id: &str,
    initiator: bool,
    media: MediaConstraints,
    duration_secs: Option<u64>,
) -> Result<()> {
    let channel = Arc::new(client.channel()?);
    let participant = channel.local_participant().clone();
    let config = CallConfig {
        display_name: Some(participant.to_string()),
        media,
        ..CallConfig::default()
    };
    let controller = Arc::new(CallController::new(
        CallId::parse(call_id)?,
        channel,
        Arc::new(LoopbackBackend::new()),
        config,
    ));

    let printer = {
        use tokio_stream::StreamExt;
        let events = controller.events();
        tokio::spawn(async move {
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                let ended = matches!(event, CallEvent::CallEnded);
                println!("{}", describe(&event));
                if ended {
                    break;
                }
            }
        })
    };

    println!("Joining {call_id} as {participant}");
    controller.start_call(initiator).await?;

    let stop = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    let mut status = controller.status_watch();
    tokio::select! {
        () = stop => {}
        _ = status.wait_for(|s| *s == CallStatus::Ended) => {}
    }

    controller.end_call().await?;
    let _ = printer.await;
    Ok(())
}

fn describe(event: &CallEvent) -> String {
    match event {
        CallEvent::ParticipantJoined { participant } => {
            format!("+ {} ({})", participant.id, participant.display_name)
        }
        CallEvent::ParticipantLeft { participant } => format!("- {participant}"),
        CallEvent::StreamReceived {
            participant,
            stream,
        } => format!("  media from {participant}: {} track(s)", stream.tracks().len()),
        CallEvent::StreamRemoved { participant, .. } => format!("  media from {participant} stopped"),
        CallEvent::StatusChanged { status } => format!("status: {status:?}"),
        CallEvent::QualityChanged {
            participant,
            quality,
        } => format!("  quality {participant}: {quality:?}"),
        CallEvent::CallEnded => "call ended".to_string(),
        CallEvent::Error { participant, error } => match participant {
            Some(p) => format!("! {p}: {error}"),
            None => format!("! {error}"),
        },
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
        "sierra", "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{word}-{:04}", rng.gen_range(0..10_000))
}
