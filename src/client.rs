//! Client flows: the interactive chat prompt and one-shot send.

use std::io::Write;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::Line,
    config::ClientConfig,
    connection::{CloseReason, Connection, ConnectionEvent, ConnectionOptions},
    error::ClientError,
    prompt::{Console, Input, Prompt},
};

/// How a client session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `quit`, end of console input, or an interrupt.
    Quit,
    /// The server closed the connection.
    ServerClosed,
    /// One-shot message sent; the reply, if any, was printed.
    Sent,
}

pub async fn run(
    config: &ClientConfig,
    shutdown: CancellationToken,
) -> Result<Outcome, ClientError> {
    let mut console = Console::stdout();
    console
        .notice(&format!("Connecting to {}:{}...", config.host, config.port))
        .map_err(ClientError::Console)?;

    let options = ConnectionOptions::default();
    let connect = Connection::connect(&config.host, config.port, shutdown.child_token(), &options);
    let mut connection = tokio::select! {
        connection = connect => connection?,
        _ = shutdown.cancelled() => return Ok(Outcome::Quit),
    };
    info!(peer = %connection.peer(), "connected");

    let outcome = match &config.message {
        Some(message) => send_once(&mut connection, message, &mut console).await?,
        None => {
            for line in [
                "Connected to server!",
                "",
                "Type messages to send to server (type \"quit\" to exit):",
                "",
            ] {
                console.notice(line).map_err(ClientError::Console)?;
            }
            let prompt = Prompt::stdin(shutdown.clone()).map_err(ClientError::Console)?;
            chat(&mut connection, prompt, &mut console).await?
        }
    };

    let farewell = match outcome {
        Outcome::Quit => "\nGoodbye!",
        Outcome::ServerClosed => "\nServer disconnected",
        Outcome::Sent => "Disconnected from server",
    };
    console.notice(farewell).map_err(ClientError::Console)?;
    Ok(outcome)
}

/// Runs the prompt loop until the operator quits or the connection ends.
///
/// Inbound lines are printed as they arrive while input is pending. On the
/// way out the connection is closed and its terminal event awaited.
pub async fn chat<W: Write>(
    connection: &mut Connection,
    mut prompt: Prompt,
    console: &mut Console<W>,
) -> Result<Outcome, ClientError> {
    console.prompt().map_err(ClientError::Console)?;

    let outcome = loop {
        tokio::select! {
            input = prompt.next_input() => match input.map_err(ClientError::Console)? {
                Some(Input::Message(text)) => {
                    let sent = Line::try_from(text)
                        .map_err(ClientError::from)
                        .and_then(|line| connection.send(line).map_err(ClientError::from));
                    if let Err(err) = sent {
                        warn!(error = %err, "message not sent");
                    }
                    console.prompt().map_err(ClientError::Console)?;
                }
                Some(Input::Quit) | None => break Outcome::Quit,
            },
            event = connection.next_event() => match event {
                Some(ConnectionEvent::Line(line)) => {
                    console.inbound(&line).map_err(ClientError::Console)?;
                }
                Some(ConnectionEvent::Closed(CloseReason::Local)) => break Outcome::Quit,
                Some(ConnectionEvent::Closed(_)) | None => return Ok(Outcome::ServerClosed),
                Some(ConnectionEvent::Failed(err)) => return Err(ClientError::Transport(err)),
            },
        }
    };

    close_and_drain(connection).await;
    Ok(outcome)
}

/// Sends `message`, prints the first reply line and closes. A message with an
/// embedded newline is rejected before anything is written.
pub async fn send_once<W: Write>(
    connection: &mut Connection,
    message: &str,
    console: &mut Console<W>,
) -> Result<Outcome, ClientError> {
    connection.send(Line::try_from(message)?)?;

    let reply = match connection.next_event().await {
        Some(ConnectionEvent::Line(line)) => Some(line),
        Some(ConnectionEvent::Closed(_)) | None => None,
        Some(ConnectionEvent::Failed(err)) => return Err(ClientError::Transport(err)),
    };

    console
        .notice(&format!("Sent: {message}"))
        .map_err(ClientError::Console)?;
    let printed = match reply {
        Some(line) => console.notice(&format!("Response: {}", line.to_text().trim())),
        None => console.notice("Response: <none, server closed the connection>"),
    };
    printed.map_err(ClientError::Console)?;

    close_and_drain(connection).await;
    Ok(Outcome::Sent)
}

async fn close_and_drain(connection: &mut Connection) {
    connection.close();
    while let Some(event) = connection.next_event().await {
        match event {
            ConnectionEvent::Line(line) => debug!(?line, "dropping line received while closing"),
            ConnectionEvent::Closed(reason) => debug!(?reason, "connection closed"),
            ConnectionEvent::Failed(err) => warn!(error = %err, "connection failed while closing"),
        }
    }
}
