//! Chorus Daemon
//!
//! Wires the orchestration core to the outside world: loads configuration,
//! constructs the registry, synthesizer, and model backends as explicit
//! instances, starts the three transport servers and the expiry sweeper, and
//! feeds inbound streaming requests into the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use chorus_core::transport::push_router;
use chorus_core::{
    ChorusConfig, ModelBackend, OllamaBackend, Orchestrator, RoomServer, ScriptedBackend,
    SocketServer, StreamRegistry, StreamRequest, Synthesizer, TransportKind,
};

/// Multi-model streaming orchestration daemon.
#[derive(Debug, Parser)]
#[command(name = "chorus-daemon", version, about)]
struct Args {
    /// Path to the TOML config file (defaults to the XDG location).
    #[arg(long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated model names to serve.
    #[arg(long, env = "CHORUS_MODELS", value_delimiter = ',', default_value = "llama3")]
    models: Vec<String>,

    /// Use scripted demo backends instead of a real inference server.
    #[arg(long)]
    demo: bool,

    /// Log filter (overrides RUST_LOG).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,chorus_core=debug")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ChorusConfig::load(args.config.as_deref())?;
    tracing::info!(
        max_streams = config.streaming.max_concurrent_streams,
        models = ?args.models,
        demo = args.demo,
        "Starting chorus daemon"
    );

    let registry = StreamRegistry::with_room_capacity(
        config.streaming.clone(),
        config.transport.room_channel_capacity,
    );
    let synthesizer = Arc::new(Synthesizer::new(config.synthesis.clone()));

    let mut orchestrator = Orchestrator::new(registry.clone(), synthesizer);
    for model in &args.models {
        let backend: Arc<dyn ModelBackend> = if args.demo {
            Arc::new(ScriptedBackend::completing(
                model.clone(),
                format!("{model} demo response: lorem ipsum dolor sit amet"),
            ))
        } else {
            Arc::new(OllamaBackend::from_env(model.clone()))
        };
        orchestrator.register_backend(backend);
    }
    let orchestrator = Arc::new(orchestrator);

    let sweeper = registry.start_sweeper();

    // Push-socket transport, which doubles as the request intake.
    let (request_tx, request_rx) = mpsc::channel::<StreamRequest>(32);
    let socket_listener = TcpListener::bind(&config.transport.socket_addr).await?;
    tokio::spawn(SocketServer::new(registry.clone(), request_tx).serve(socket_listener));

    // HTTP server-push transport plus the stats surface.
    let http_listener = TcpListener::bind(&config.transport.http_addr).await?;
    let router = push_router(registry.clone(), config.transport.heartbeat_interval);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router).await {
            tracing::error!(error = %e, "HTTP push server exited");
        }
    });

    // Room-broadcast transport.
    let room_listener = TcpListener::bind(&config.transport.room_addr).await?;
    tokio::spawn(RoomServer::new(registry.clone()).serve(room_listener));

    let intake = tokio::spawn(request_intake(
        request_rx,
        registry.clone(),
        Arc::clone(&orchestrator),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    intake.abort();
    sweeper.abort();
    Ok(())
}

/// Admit and run inbound requests, one orchestration task per stream.
async fn request_intake(
    mut requests: mpsc::Receiver<StreamRequest>,
    registry: StreamRegistry,
    orchestrator: Arc<Orchestrator>,
) {
    while let Some(mut request) = requests.recv().await {
        if request.conversation_id.is_empty() {
            request.conversation_id = uuid::Uuid::new_v4().to_string();
            tracing::debug!(
                conversation_id = %request.conversation_id,
                "Assigned conversation id to anonymous request"
            );
        }

        match registry.open_stream(&request.conversation_id, TransportKind::Socket) {
            Ok(()) => {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    match orchestrator.run(&request).await {
                        Ok(_) => {
                            tracing::info!(
                                conversation_id = %request.conversation_id,
                                "Stream finished"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                conversation_id = %request.conversation_id,
                                error = %e,
                                "Stream failed"
                            );
                        }
                    }
                });
            }
            Err(e) => {
                // Admission-control reject: subscribers of the conversation
                // are told; the client should retry later.
                tracing::warn!(
                    conversation_id = %request.conversation_id,
                    error = %e,
                    "Rejected streaming request"
                );
                registry.broadcast(
                    &request.conversation_id,
                    chorus_core::EventPayload::StreamError {
                        error: e.to_string(),
                    },
                );
            }
        }
    }
}
