use std::time::Duration;

use clap::Parser;
use nsq_client::{Config, NsqError, Producer};

#[derive(Debug, thiserror::Error)]
enum ProducerError {
    #[error("nsq: {0}")]
    Nsq(#[from] NsqError),
}

#[derive(Parser, Debug)]
#[command(name = "nsq-producer", about = "Publish a test payload to an NSQ topic")]
struct Cli {
    /// Number of messages to publish
    #[arg(long, default_value_t = 1)]
    messages: u64,

    /// nsqd TCP address, e.g. 127.0.0.1:4150
    #[arg(long, env = "NSQD")]
    broker: String,

    #[arg(long, default_value = "faas-request")]
    topic: String,

    /// Pause between messages (Go-style duration)
    #[arg(long, default_value = "100ms", value_parser = pause)]
    pause: Duration,

    #[arg(long, default_value = "Test the function.")]
    payload: String,
}

fn pause(value: &str) -> Result<Duration, String> {
    nsq_client::parse_duration(value).ok_or_else(|| format!("invalid duration '{value}'"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        tracing::error!(error = %e, "producer failed");
        std::process::exit(1);
    }
}

fn producer_config() -> Config {
    Config {
        dial_timeout: Duration::from_secs(4),
        write_timeout: Duration::from_secs(3),
        ..Config::default()
    }
}

async fn run(cli: &Cli) -> Result<(), ProducerError> {
    let mut producer = Producer::connect(cli.broker.clone(), producer_config()).await?;
    tracing::info!(broker = %producer.addr(), topic = %cli.topic, messages = cli.messages, "publishing");

    for i in 0..cli.messages {
        tokio::select! {
            res = producer.publish(&cli.topic, cli.payload.clone().into_bytes()) => res?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(sent = i, "interrupted");
                break;
            }
        }
        tracing::info!(n = i + 1, topic = %cli.topic, "published");
        if i + 1 < cli.messages {
            tokio::time::sleep(cli.pause).await;
        }
    }

    producer.stop().await;
    Ok(())
}
