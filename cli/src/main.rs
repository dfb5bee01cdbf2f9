//! courier - operator command line for the event-sourced API broker.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use courier_broker::{HttpApi, MockApi, RequestProcessor, RequestWatcher, UpstreamApi};
use courier_core::{Event, EventStore, LoggingEventStore};
use courier_postgres::PostgresEventStore;
use courier_testing::MemoryEventStore;
use courier_web::{ingress_router, upstream_router, BrittleSettings};
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Prototype for an event-sourcing inspired API binding.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Driver for the event store.
    #[arg(long, env = "EVENTSTORE_DRIVER", value_enum, default_value_t = Driver::Postgres)]
    eventstore_driver: Driver,

    /// Hostname of the DB server for the event store.
    #[arg(long, env = "EVENTSTORE_DB_HOST", default_value = "localhost")]
    eventstore_db_host: String,

    /// Minimum log level (trace, debug, info, warn, error).
    #[arg(long, env = "EVENTSTORE_LOGLEVEL", default_value = "info")]
    eventstore_loglevel: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Driver {
    /// Durable PostgreSQL backend.
    Postgres,
    /// In-process store; useful for experiments within a single process.
    Memory,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a configuration event into the store.
    Configure {
        /// Number of times to retry a failed request; negative leaves the
        /// current value unchanged.
        #[arg(long, default_value_t = -1)]
        retries: i32,

        /// Maximum duration for a request in seconds; negative leaves the
        /// current value unchanged, zero disables the timeout.
        #[arg(long, default_value_t = -1.0)]
        timeout: f64,
    },

    /// Insert an event into the store.
    Insert {
        /// Event class, one of [simple, request, response, failure].
        class: String,
        /// Event payload.
        data: String,
        /// Id of the event to register as causation.
        #[arg(long, default_value = "0")]
        causation: String,
        /// Optional idempotency key to attach to the event.
        #[arg(long)]
        external_uuid: Option<Uuid>,
    },

    /// List all events in the store.
    List {
        /// Id of the event after which to start listing.
        #[arg(long, default_value = "")]
        start_after: String,
    },

    /// Process events from the store.
    Process {
        /// Id of the event after which to start processing.
        #[arg(long, default_value = "")]
        start_after: String,

        /// Base URL of a real upstream API; the mock is used when absent.
        #[arg(long)]
        api_url: Option<String>,

        /// Fraction of mock API requests that fail.
        #[arg(long, default_value_t = 0.0)]
        api_failure_rate: f64,

        /// Fraction of failing mock API requests without any response.
        #[arg(long, default_value_t = 0.0)]
        api_silent_failure_rate: f64,

        /// Minimal mock API latency in seconds.
        #[arg(long, default_value_t = 0.0)]
        api_min_latency: f64,

        /// Maximal mock API latency in seconds.
        #[arg(long, default_value_t = 0.0)]
        api_max_latency: f64,
    },

    /// Watch notifications from the store.
    Watch,

    /// Watch requests as they are processed.
    WatchRequests {
        /// Id of the event after which to start watching.
        #[arg(long, default_value = "")]
        start_after: String,
    },

    /// Resolve an external UUID to the according internal event id.
    ResolveExternalUuid {
        /// The idempotency key to resolve.
        external_uuid: Uuid,
    },

    /// Serve the HTTP ingress for client submissions.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },

    /// Serve the brittle mock upstream API.
    ServeUpstream {
        /// Port to listen on.
        #[arg(long, default_value_t = 8001)]
        port: u16,

        /// Fraction of requests that fail.
        #[arg(long, default_value_t = 0.0)]
        api_failure_rate: f64,

        /// Fraction of failing requests without any response.
        #[arg(long, default_value_t = 0.0)]
        api_silent_failure_rate: f64,

        /// Minimal handling delay in seconds.
        #[arg(long, default_value_t = 0.0)]
        api_min_latency: f64,

        /// Maximal handling delay in seconds.
        #[arg(long, default_value_t = 0.0)]
        api_max_latency: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.eventstore_loglevel)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Configure { retries, timeout } => configure(&cli, retries, timeout).await,
        Command::Insert {
            ref class,
            ref data,
            ref causation,
            external_uuid,
        } => insert(&cli, class, data, causation, external_uuid).await,
        Command::List { ref start_after } => list(&cli, start_after).await,
        Command::Process {
            ref start_after,
            ref api_url,
            api_failure_rate,
            api_silent_failure_rate,
            api_min_latency,
            api_max_latency,
        } => {
            let api: Arc<dyn UpstreamApi> = match api_url {
                Some(url) => Arc::new(HttpApi::new(url.clone())),
                None => Arc::new(MockApi::new(
                    api_failure_rate,
                    api_silent_failure_rate,
                    api_min_latency,
                    api_max_latency,
                )),
            };
            process(&cli, start_after, api).await
        }
        Command::Watch => watch(&cli).await,
        Command::WatchRequests { ref start_after } => watch_requests(&cli, start_after).await,
        Command::ResolveExternalUuid { external_uuid } => {
            resolve_external_uuid(&cli, external_uuid).await
        }
        Command::Serve { port } => serve(&cli, port).await,
        Command::ServeUpstream {
            port,
            api_failure_rate,
            api_silent_failure_rate,
            api_min_latency,
            api_max_latency,
        } => {
            serve_upstream(
                port,
                BrittleSettings {
                    failure_rate: api_failure_rate,
                    silent_failure_rate: api_silent_failure_rate,
                    min_latency: api_min_latency,
                    max_latency: api_max_latency,
                },
            )
            .await
        }
    }
}

/// Build the selected backend and wrap it in the logging decorator, the
/// wiring every command shares.
async fn init_event_store(cli: &Cli) -> Result<Arc<dyn EventStore>> {
    let store: Arc<dyn EventStore> = match cli.eventstore_driver {
        Driver::Postgres => {
            let url = format!(
                "postgres://postgres:postgres@{}:5432/postgres",
                cli.eventstore_db_host
            );
            let store = PostgresEventStore::connect(&url).await?;
            store.run_migrations().await?;
            Arc::new(store)
        }
        Driver::Memory => Arc::new(MemoryEventStore::new()),
    };
    info!(host = %cli.eventstore_db_host, driver = ?cli.eventstore_driver, "initialized event store");
    Ok(Arc::new(LoggingEventStore::new(store)))
}

async fn finalize_event_store(store: &Arc<dyn EventStore>) {
    if let Err(error) = store.close().await {
        tracing::error!(%error, "failed to close event store");
    }
}

fn parse_start_after(store: &Arc<dyn EventStore>, text: &str) -> Result<i32> {
    if text.is_empty() {
        Ok(0)
    } else {
        Ok(store.parse_event_id(text)?)
    }
}

async fn configure(cli: &Cli, retries: i32, timeout: f64) -> Result<()> {
    let store = init_event_store(cli).await?;
    let envelope = store
        .insert(Uuid::nil(), Event::Configuration { retries, timeout }, 0)
        .await?;
    debug!(id = envelope.id, "inserted configuration event");
    finalize_event_store(&store).await;
    Ok(())
}

async fn insert(
    cli: &Cli,
    class: &str,
    data: &str,
    causation: &str,
    external_uuid: Option<Uuid>,
) -> Result<()> {
    let event = match class {
        "simple" => Event::Simple {
            message: data.to_string(),
        },
        "request" => Event::Request {
            request: data.to_string(),
        },
        "response" => Event::ApiResponse {
            attempt: 0,
            response: data.to_string(),
        },
        "failure" => Event::ApiFailure {
            attempt: 0,
            failure: data.to_string(),
        },
        other => bail!("unrecognized event class: {other}"),
    };

    let store = init_event_store(cli).await?;
    let causation_id = store.parse_event_id(causation)?;
    let envelope = store
        .insert(external_uuid.unwrap_or_else(Uuid::nil), event, causation_id)
        .await?;
    debug!(id = envelope.id, "inserted new event");
    finalize_event_store(&store).await;
    Ok(())
}

async fn list(cli: &Cli, start_after: &str) -> Result<()> {
    let store = init_event_store(cli).await?;
    let start_after = parse_start_after(&store, start_after)?;

    let mut events = store.load_events(start_after).await?;
    while let Some(envelope) = events.next().await {
        info!(
            id = envelope.id,
            class = envelope.event.class(),
            created = %envelope.created.to_rfc3339(),
            causation_id = envelope.causation_id,
            external_uuid = %envelope.external_uuid,
            data = ?envelope.event,
            "event"
        );
    }

    let stream_error = store.error();
    finalize_event_store(&store).await;
    if let Some(error) = stream_error {
        bail!(error);
    }
    Ok(())
}

async fn process(cli: &Cli, start_after: &str, api: Arc<dyn UpstreamApi>) -> Result<()> {
    let store = init_event_store(cli).await?;
    let start_after = parse_start_after(&store, start_after)?;

    let mut processor = RequestProcessor::new(Arc::clone(&store), api);
    tokio::select! {
        result = processor.run(start_after) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    finalize_event_store(&store).await;
    Ok(())
}

async fn watch(cli: &Cli) -> Result<()> {
    let store = init_event_store(cli).await?;
    let mut notifications = store.follow_notifications().await?;

    let follow = async {
        while let Some(notification) = notifications.next().await {
            info!(id = notification.id, "received notification");
        }
    };
    tokio::select! {
        () = follow => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let stream_error = store.error();
    finalize_event_store(&store).await;
    if let Some(error) = stream_error {
        bail!(error);
    }
    Ok(())
}

async fn watch_requests(cli: &Cli, start_after: &str) -> Result<()> {
    let store = init_event_store(cli).await?;
    let start_after = parse_start_after(&store, start_after)?;

    let mut watcher = RequestWatcher::new(Arc::clone(&store));
    tokio::select! {
        result = watcher.run(start_after) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    finalize_event_store(&store).await;
    Ok(())
}

async fn resolve_external_uuid(cli: &Cli, external_uuid: Uuid) -> Result<()> {
    let store = init_event_store(cli).await?;
    let id = store.resolve_uuid(external_uuid).await?;
    println!("{id}");
    finalize_event_store(&store).await;
    Ok(())
}

async fn serve(cli: &Cli, port: u16) -> Result<()> {
    let store = init_event_store(cli).await?;
    let app = ingress_router(Arc::clone(&store));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for client submissions");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    finalize_event_store(&store).await;
    Ok(())
}

async fn serve_upstream(port: u16, settings: BrittleSettings) -> Result<()> {
    let app = upstream_router(settings);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for upstream requests");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
