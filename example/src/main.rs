use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use porta::Result;

mod blocking;
mod nonblocking;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // blocking calls must leave the runtime worker
    tokio::task::spawn_blocking(|| trace_span!("blocking").in_scope(blocking::main))
        .await
        .map_err(std::io::Error::other)??;

    nonblocking::main().instrument(trace_span!("nonblocking")).await?;

    Ok(())
}
