use clap::Parser;
use console::style;
use proxyssh::cli::{self, Cli, RunConfig};
use proxyssh::services::session_relay::RelayExit;
use proxyssh::utils::error::ProxySshError;
use proxyssh::utils::logger;
use proxyssh::utils::prompt::{Prompter, TerminalPrompter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logger
    logger::init(cli.verbose);
    tracing::info!("proxyssh {} starting", env!("CARGO_PKG_VERSION"));

    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter::new());
    let code = match cli.into_run_config(Arc::clone(&prompter)) {
        Ok(config) => run(config, prompter).await,
        Err(e) => report(&e),
    };

    // A pending read on stdin would keep the runtime from shutting down
    std::process::exit(code);
}

async fn run(config: RunConfig, prompter: Arc<dyn Prompter>) -> i32 {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                return;
            }
            shutdown.cancel();

            // A second Ctrl-C gives up on the graceful teardown
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Second interrupt, exiting immediately");
                eprintln!("\r\n{}", style("Interrupted").yellow());
                std::process::exit(RelayExit::Interrupted.exit_code());
            }
        });
    }

    tracing::debug!(
        "Connecting to {} via {}",
        config.destination,
        config.proxy
    );

    match cli::run(config, prompter, shutdown).await {
        Ok(exit) => {
            if exit == RelayExit::Interrupted {
                eprintln!("\r\n{}", style("Interrupted").yellow());
            }
            exit.exit_code()
        }
        Err(e) => report(&e),
    }
}

fn report(error: &ProxySshError) -> i32 {
    tracing::debug!("Fatal: {:?}", error);
    eprintln!("{} {}", style("Error:").red().bold(), error.user_message());
    if error.is_proxy_error() {
        let hint = "Check the proxy URL and that the proxy allows tunnels to the destination port";
        eprintln!("{}", style(hint).dim());
    }
    error.exit_code()
}
