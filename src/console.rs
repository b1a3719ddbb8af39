/// Terminal front end for a sampler session.
///
/// Shows the output file, asks for the password without echo, and offers
/// start/stop/status/quit. Only the actions valid for the current state are
/// offered.
use crate::credential::Credential;
use crate::session::{SamplerSession, StartOutcome, WorkerSummary};
use crate::signals::SignalHandler;
use crate::status::SessionState;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Quit,
}

/// Parse one input line. `None` for anything unrecognized.
pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" | "s" => Some(Command::Start),
        "stop" | "x" => Some(Command::Stop),
        "status" => Some(Command::Status),
        "quit" | "q" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// Which of start/stop may be offered in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions {
    pub start: bool,
    pub stop: bool,
}

pub fn available_actions(state: SessionState) -> Actions {
    let sampling = state == SessionState::Sampling;
    Actions {
        start: !sampling,
        stop: sampling,
    }
}

fn prompt(actions: Actions) -> String {
    let mut choices = Vec::new();
    if actions.start {
        choices.push("start");
    }
    if actions.stop {
        choices.push("stop");
    }
    choices.push("status");
    choices.push("quit");
    format!("[{}]> ", choices.join(" | "))
}

/// Turns terminal echo off until dropped. Does nothing when stdin is not a tty.
struct EchoGuard {
    original: Option<Termios>,
}

impl EchoGuard {
    fn disable() -> Self {
        let stdin = std::io::stdin();
        let original = match tcgetattr(&stdin) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(error = %e, "stdin is not a terminal, input will echo");
                return Self { original: None };
            }
        };

        let mut masked = original.clone();
        masked.local_flags.remove(LocalFlags::ECHO);
        masked.local_flags.insert(LocalFlags::ECHONL);
        if let Err(e) = tcsetattr(&stdin, SetArg::TCSANOW, &masked) {
            tracing::debug!(error = %e, "failed to disable echo");
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, original);
        }
    }
}

pub struct Console<R, W> {
    lines: Lines<R>,
    out: W,
    mask_input: bool,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `mask_input` turns terminal echo off while the password is typed.
    pub fn new(input: R, out: W, mask_input: bool) -> Self {
        Self {
            lines: input.lines(),
            out,
            mask_input,
        }
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.out
    }

    /// Drive `session` until quit, end of input, or a shutdown signal.
    /// The session is always shut down before returning.
    pub async fn run(
        &mut self,
        session: &mut SamplerSession,
        signals: &SignalHandler,
    ) -> std::io::Result<Option<WorkerSummary>> {
        self.say(&format!(
            "Output file: {}",
            session.output_file().display()
        ))
        .await?;

        // Open on the password prompt, as the original form did.
        let mut pending = Some(Command::Start);

        loop {
            if signals.shutdown_requested() {
                break;
            }

            let command = match pending.take() {
                Some(c) => c,
                None => {
                    let actions = available_actions(session.state());
                    self.out.write_all(prompt(actions).as_bytes()).await?;
                    self.out.flush().await?;

                    let line = tokio::select! {
                        line = self.lines.next_line() => line?,
                        _ = signals.wait() => break,
                    };
                    let Some(line) = line else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Some(c) => c,
                        None => {
                            self.say(&format!("Unknown command: {}", line.trim())).await?;
                            continue;
                        }
                    }
                }
            };

            match command {
                Command::Start => {
                    if !available_actions(session.state()).start {
                        self.say("Already sampling.").await?;
                        continue;
                    }
                    if !self.start(session, signals).await? {
                        break;
                    }
                }
                Command::Stop => {
                    if session.stop() {
                        self.say(&format!("Status: {}", session.status())).await?;
                    } else {
                        self.say("Not sampling.").await?;
                    }
                }
                Command::Status => {
                    let data = session.snapshot();
                    self.say(&format!(
                        "Status: {} (samples ok: {}, failed: {})",
                        data.status, data.cycles_ok, data.cycles_failed
                    ))
                    .await?;
                }
                Command::Quit => break,
            }
        }

        let summary = session.shutdown().await;
        if let Some(s) = &summary {
            self.say(&format!(
                "Stopped after {} samples ({} failed).",
                s.succeeded, s.failed
            ))
            .await?;
        }
        Ok(summary)
    }

    /// Prompt for the password and start sampling. Returns false when input
    /// ended or shutdown was requested while prompting.
    async fn start(
        &mut self,
        session: &mut SamplerSession,
        signals: &SignalHandler,
    ) -> std::io::Result<bool> {
        self.out.write_all(b"Password: ").await?;
        self.out.flush().await?;

        let line = {
            let _echo = self.mask_input.then(EchoGuard::disable);
            tokio::select! {
                line = self.lines.next_line() => line?,
                _ = signals.wait() => return Ok(false),
            }
        };
        let Some(line) = line else {
            return Ok(false);
        };

        match session.start(Credential::new(line)).await {
            Ok(StartOutcome::Started) | Ok(StartOutcome::AlreadySampling) => {}
            Err(e) => self.say(&format!("Error: {e}")).await?,
        }
        self.say(&format!("Status: {}", session.status())).await?;
        Ok(true)
    }

    async fn say(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }
}
