//! workq CLI: operator interface to a Postgres-backed queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workq::config::Config;
use workq::config::secrets::ExposeSecret;
use workq::engine::{HandlerError, Queue, handler_fn};
use workq::model::{CountFilter, MessageId, NewMessage, Status};
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::transport::PostgresTransport;

#[derive(Parser)]
#[command(name = "workq", about = "Operate a transactional work queue")]
struct Cli {
    /// Queue name (overrides WORKQ_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue's storage
    CreateQueue,
    /// Delete the queue and all of its messages
    RemoveQueue,
    /// Send one message
    Send {
        /// Message type
        message_type: String,
        /// Message body (stored as UTF-8 bytes)
        body: String,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        expiration_ms: Option<u64>,
        #[arg(long, default_value_t = 0)]
        priority: u16,
        #[arg(long)]
        route: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Count messages
    Count {
        /// Only count this status (repeatable)
        #[arg(long)]
        status: Vec<Status>,
        #[arg(long)]
        route: Option<String>,
        #[arg(long = "type")]
        message_type: Option<String>,
    },
    /// Show one message
    Show { id: MessageId },
    /// Consume messages, logging each one, until Ctrl-C
    Consume {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Only claim messages on this route (repeatable)
        #[arg(long)]
        route: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new("workq")
            .endpoint(config.otel_endpoint.clone())
            .log_level(config.log_level.clone()),
    )?;

    let queue_name = cli.queue.unwrap_or_else(|| config.queue_name.clone());
    let transport =
        PostgresTransport::connect(config.database_url.expose_secret(), &queue_name).await?;
    let queue = Queue::builder(Arc::new(transport))
        .configuration(config.queue_configuration()?)
        .build()?;

    match cli.command {
        Command::CreateQueue => {
            queue.create().await?;
            println!("Created queue {queue_name}");
        }
        Command::RemoveQueue => {
            queue.remove().await?;
            println!("Removed queue {queue_name}");
        }
        Command::Send {
            message_type,
            body,
            delay_ms,
            expiration_ms,
            priority,
            route,
            correlation_id,
        } => {
            let mut message = NewMessage::new(message_type, body).priority(priority);
            if let Some(ms) = delay_ms {
                message = message.delay(Duration::from_millis(ms));
            }
            if let Some(ms) = expiration_ms {
                message = message.expiration(Duration::from_millis(ms));
            }
            if let Some(route) = route {
                message = message.route(route);
            }
            if let Some(id) = correlation_id {
                message = message.correlation_id(id);
            }
            let result = queue.producer().send(message).await;
            match (result.id, result.error) {
                (Some(id), None) => println!("Sent: {id}"),
                (_, Some(e)) => anyhow::bail!("send failed: {e}"),
                (None, None) => anyhow::bail!("send returned no id"),
            }
        }
        Command::Count {
            status,
            route,
            message_type,
        } => {
            let mut filter = CountFilter {
                statuses: status,
                ..CountFilter::default()
            };
            if let Some(route) = route {
                filter = filter.route(route);
            }
            if let Some(message_type) = message_type {
                filter = filter.message_type(message_type);
            }
            println!("{}", queue.count(&filter).await?);
        }
        Command::Show { id } => match queue.get(id).await? {
            Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
            None => anyhow::bail!("message {id} not found"),
        },
        Command::Consume { workers, route } => cmd_consume(&queue, workers, route).await?,
    }

    Ok(())
}

async fn cmd_consume(
    queue: &Queue,
    workers: Option<usize>,
    routes: Vec<String>,
) -> anyhow::Result<()> {
    let filter = routes
        .into_iter()
        .fold(workq::model::ClaimFilter::default(), |f, r| f.route(r));
    let mut consumer = queue.consumer().with_filter(filter);
    if let Some(workers) = workers {
        consumer.configuration_mut()?.worker.worker_count = workers;
    }

    consumer.start(handler_fn(|message, _notification| async move {
        tracing::info!(
            id = %message.id,
            message_type = %message.message_type,
            attempt = message.attempt_count,
            bytes = message.body.len(),
            "consumed"
        );
        Ok::<(), HandlerError>(())
    }))?;

    tokio::signal::ctrl_c().await?;
    consumer.stop().await;
    Ok(())
}
