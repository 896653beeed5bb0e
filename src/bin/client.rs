use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use line_chat::{
    client,
    config::ClientConfig,
    error::{ClientError, ConnectionError},
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    line_chat::init_tracing(&config.log_level);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    match client::run(&config, shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Connection error: {err}");
            if matches!(
                err,
                ClientError::Connection(ConnectionError::ConnectFailure { .. })
            ) {
                eprintln!();
                eprintln!("Troubleshooting:");
                eprintln!("  1. Make sure the chat server is running");
                eprintln!("  2. Check that both machines are on the same network");
                eprintln!("  3. Check the --host and --port values (or CHAT_HOST / CHAT_PORT)");
                eprintln!("  4. Check that no firewall blocks the port");
            }
            ExitCode::FAILURE
        }
    }
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => shutdown.cancel(),
        Err(err) => warn!(error = %err, "failed to install ctrl-c handler"),
    }
}
