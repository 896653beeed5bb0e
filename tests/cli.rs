use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    process::{Child, Command},
    time::timeout,
};

const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

const SERVER_BIN: &str = env!("CARGO_BIN_EXE_chat-server");
const CLIENT_BIN: &str = env!("CARGO_BIN_EXE_chat-client");

struct ServerProcess {
    child: Child,
    port: u16,
}

impl ServerProcess {
    async fn spawn() -> Result<Self> {
        let mut child = Command::new(SERVER_BIN)
            .args(["--host", "127.0.0.1", "--port", "0"])
            .env("RUST_LOG", "warn")
            .env_remove("CHAT_HOST")
            .env_remove("CHAT_PORT")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn server")?;

        let stdout = child.stdout.take().context("server stdout missing")?;
        let mut banner = String::new();
        timeout(PROCESS_TIMEOUT, BufReader::new(stdout).read_line(&mut banner))
            .await
            .context("timed out waiting for server banner")??;

        let port = banner
            .trim()
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| anyhow!("unexpected server banner: {banner:?}"))?;

        Ok(Self { child, port })
    }
}

fn client(port: u16) -> Command {
    let mut cmd = Command::new(CLIENT_BIN);
    cmd.args(["--host", "127.0.0.1", "--port", &port.to_string()])
        .env("RUST_LOG", "warn")
        .env_remove("CHAT_HOST")
        .env_remove("CHAT_PORT")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

struct Finished {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn finish(mut child: Child, input: &[u8]) -> Result<Finished> {
    let mut stdin = child.stdin.take().context("client stdin missing")?;
    stdin.write_all(input).await?;
    drop(stdin);

    let mut stdout = child.stdout.take().context("client stdout missing")?;
    let mut stderr = child.stderr.take().context("client stderr missing")?;
    let mut out = String::new();
    let mut err = String::new();

    let status = timeout(PROCESS_TIMEOUT, async {
        stdout.read_to_string(&mut out).await?;
        stderr.read_to_string(&mut err).await?;
        child.wait().await
    })
    .await
    .context("client did not exit")??;

    Ok(Finished {
        success: status.success(),
        stdout: out,
        stderr: err,
    })
}

#[tokio::test]
async fn quit_exits_cleanly() -> Result<()> {
    let mut server = ServerProcess::spawn().await?;

    let child = client(server.port).spawn()?;
    let finished = finish(child, b"hello\nquit\n").await?;

    assert!(finished.success, "stderr: {}", finished.stderr);
    assert!(finished.stdout.contains("Connected to server!"));
    assert!(finished.stdout.contains("Goodbye!"));

    let _ = server.child.kill().await;
    Ok(())
}

#[tokio::test]
async fn one_shot_message_prints_echo() -> Result<()> {
    let mut server = ServerProcess::spawn().await?;

    let child = client(server.port).args(["--message", "ping"]).spawn()?;
    let finished = finish(child, b"").await?;

    assert!(finished.success, "stderr: {}", finished.stderr);
    assert!(finished.stdout.contains("Sent: ping"));
    assert!(finished.stdout.contains("Response: ping"));

    let _ = server.child.kill().await;
    Ok(())
}

#[tokio::test]
async fn connect_failure_exits_non_zero() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let child = client(port).spawn()?;
    let finished = finish(child, b"").await?;

    assert!(!finished.success);
    assert!(finished.stderr.contains("failed to connect"));
    assert!(finished.stderr.contains("Troubleshooting"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_exits_cleanly() -> Result<()> {
    let mut server = ServerProcess::spawn().await?;

    let mut child = client(server.port).spawn()?;
    // Held open so only the interrupt can end the session.
    let _stdin = child.stdin.take().context("client stdin missing")?;
    let stdout = child.stdout.take().context("client stdout missing")?;
    let mut stdout = BufReader::new(stdout);

    let mut banner = String::new();
    timeout(PROCESS_TIMEOUT, async {
        while !banner.contains("Connected to server!") {
            if stdout.read_line(&mut banner).await? == 0 {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await
    .context("timed out waiting for client banner")??;
    assert!(banner.contains("Connected to server!"), "stdout: {banner}");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pid = child.id().context("client already exited")?;
    let status = Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status()
        .await?;
    assert!(status.success());

    let mut rest = String::new();
    let status = timeout(PROCESS_TIMEOUT, async {
        stdout.read_to_string(&mut rest).await?;
        child.wait().await
    })
    .await
    .context("client did not exit after interrupt")??;

    assert!(status.success(), "exit status: {status}");
    assert!(rest.contains("Goodbye!"), "stdout: {rest}");

    let _ = server.child.kill().await;
    Ok(())
}
