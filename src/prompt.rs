//! Operator console for the client.
//!
//! Console reads block, so they run on a dedicated thread that forwards each
//! line into the async side. The thread is detached: once the client is done
//! it is left parked in `read` until the process exits.

use std::{
    io::{self, BufRead, Write},
    thread,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::Line;

pub const PROMPT: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Quit,
}

/// Classifies one console line. Blank lines yield `None`.
pub fn parse_input(raw: &str) -> Option<Input> {
    let text = raw.trim_end_matches(['\r', '\n']);
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("quit") {
        Some(Input::Quit)
    } else if trimmed.is_empty() {
        None
    } else {
        Some(Input::Message(text.to_string()))
    }
}

pub struct Prompt {
    lines: mpsc::Receiver<io::Result<String>>,
    shutdown: CancellationToken,
}

impl Prompt {
    pub fn stdin(shutdown: CancellationToken) -> io::Result<Prompt> {
        Self::spawn(io::BufReader::new(io::stdin()), shutdown)
    }

    pub fn spawn<R>(reader: R, shutdown: CancellationToken) -> io::Result<Prompt>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    let failed = line.is_err();
                    if tx.blocking_send(line).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(Prompt {
            lines: rx,
            shutdown,
        })
    }

    /// Waits for the next actionable input. `Ok(None)` means the console hit
    /// end of input or the shutdown token fired.
    pub async fn next_input(&mut self) -> io::Result<Option<Input>> {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(None),
                line = self.lines.recv() => line,
            };
            match line {
                Some(Ok(raw)) => {
                    if let Some(input) = parse_input(&raw) {
                        return Ok(Some(input));
                    }
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(None),
            }
        }
    }
}

/// Terminal output that keeps the `> ` prompt intact around inbound lines.
pub struct Console<W> {
    out: W,
}

impl Console<io::Stdout> {
    pub fn stdout() -> Self {
        Console::new(io::stdout())
    }
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.out.write_all(PROMPT.as_bytes())?;
        self.out.flush()
    }

    /// Prints a server line below the pending prompt and redraws the prompt.
    pub fn inbound(&mut self, line: &Line) -> io::Result<()> {
        let text = line.to_text();
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        write!(self.out, "\nServer: {text}\n{PROMPT}")?;
        self.out.flush()
    }

    pub fn notice(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{message}")?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn quit_is_case_insensitive() {
        assert_eq!(parse_input("quit"), Some(Input::Quit));
        assert_eq!(parse_input("QUIT\n"), Some(Input::Quit));
        assert_eq!(parse_input("  Quit \r\n"), Some(Input::Quit));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_input(""), None);
        assert_eq!(parse_input("   \n"), None);
    }

    #[test]
    fn messages_keep_inner_whitespace() {
        assert_eq!(
            parse_input("  hello world\n"),
            Some(Input::Message("  hello world".to_string()))
        );
        assert_eq!(
            parse_input("quitting time"),
            Some(Input::Message("quitting time".to_string()))
        );
    }

    #[tokio::test]
    async fn prompt_skips_blanks_and_stops_at_eof() {
        let input = Cursor::new(b"hello\n\n  \nQuit\n".to_vec());
        let mut prompt = Prompt::spawn(input, CancellationToken::new()).expect("spawn");

        assert_eq!(
            prompt.next_input().await.expect("read"),
            Some(Input::Message("hello".to_string()))
        );
        assert_eq!(prompt.next_input().await.expect("read"), Some(Input::Quit));
        assert_eq!(prompt.next_input().await.expect("read"), None);
    }

    #[tokio::test]
    async fn cancelled_prompt_returns_none() {
        let shutdown = CancellationToken::new();
        let mut prompt = Prompt::spawn(Cursor::new(b"hello\n".to_vec()), shutdown.clone())
            .expect("spawn");
        shutdown.cancel();
        assert_eq!(prompt.next_input().await.expect("read"), None);
    }

    #[test]
    fn inbound_line_redraws_prompt() {
        let mut console = Console::new(Vec::new());
        console.prompt().expect("prompt");
        for text in ["  hi there ", "   "] {
            let line = Line::try_from(text).expect("line");
            console.inbound(&line).expect("inbound");
        }

        let output = String::from_utf8(console.into_inner()).expect("utf8");
        assert_eq!(output, "> \nServer: hi there\n> ");
    }
}
