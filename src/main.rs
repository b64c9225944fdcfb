use clap::Parser;
use tail_forward::cli::{run, Args};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tail_forward=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // Usage errors are configuration errors; --help and --version are not
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let code = run(args).await;
    std::process::exit(code);
}
