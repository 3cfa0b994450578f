//! Evolving Agent - local chat agent that fine-tunes itself on its dialogue

use evolving_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they stay out of the chat transcript (RUST_LOG=info for detail)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    cli::run().await
}
