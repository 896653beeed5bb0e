use anyhow::Result;
use tracing::{info, warn};

use line_chat::{config::ServerConfig, server::Server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load()?;
    line_chat::init_tracing(&config.log_level);

    let server = Server::bind(&config).await?;
    let addr = server.local_addr()?;

    println!("Listening on: {}", addr);
    info!(
        %addr,
        echo = config.echo,
        announce = config.announce,
        max_line_length = ?config.max_line_length,
        "server started"
    );

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!(error = %err, "server exited with error");
        return Err(err.into());
    }

    Ok(())
}
