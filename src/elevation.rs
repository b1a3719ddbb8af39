/// The OS privilege-elevation mechanism (`sudo`).
///
/// Two modes are used: a one-shot interactive check that reads the password
/// from stdin (`-S -v`), and the non-interactive mode (`-n`) that reuses the
/// cached grant and fails instead of prompting once it has expired.
use crate::config::ElevationConfig;
use crate::credential::Credential;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Elevation {
    program: String,
    args: Vec<String>,
    validate_timeout: Duration,
}

/// Errors from `SamplerSession::start`.
#[derive(Debug)]
pub enum StartError {
    /// No credential was entered; nothing was invoked.
    EmptyCredential,
    /// The mechanism ran and refused the credential.
    AuthenticationFailed {
        exit_code: Option<i32>,
        detail: String,
    },
    /// The mechanism could not be run or did not answer in time.
    ElevationUnavailable {
        program: String,
        reason: String,
        source: Option<std::io::Error>,
    },
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::EmptyCredential => write!(f, "a password is required"),
            StartError::AuthenticationFailed { exit_code, detail } => {
                write!(f, "wrong password or no sudo privilege")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit {code})")?;
                }
                if !detail.is_empty() {
                    write!(f, ": {detail}")?;
                }
                Ok(())
            }
            StartError::ElevationUnavailable {
                program, reason, ..
            } => write!(f, "elevation program {program} unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::ElevationUnavailable {
                source: Some(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}

impl Elevation {
    pub fn new(program: impl Into<String>, args: Vec<String>, validate_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            validate_timeout,
        }
    }

    pub fn from_config(config: &ElevationConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.validate_timeout_secs),
        )
    }

    /// Validate `credential` once and refresh the cached grant.
    ///
    /// The credential is consumed and wiped when this returns. It is passed on
    /// stdin, never on the command line.
    pub async fn validate(&self, credential: Credential) -> Result<(), StartError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(["-S", "-v"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to spawn: {e}"), Some(e)))?;

        tracing::debug!(
            program = %self.program,
            pid = child.id().unwrap_or(0),
            "elevation check started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let payload = credential.stdin_payload();
            // sudo may exit without reading when the grant is still cached.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(error = %e, "elevation program closed stdin early");
            }
        }
        drop(credential);

        let output = match tokio::time::timeout(self.validate_timeout, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unavailable(format!("wait failed: {e}"), Some(e))),
            Err(_) => {
                return Err(self.unavailable(
                    format!("no answer within {}s", self.validate_timeout.as_secs()),
                    None,
                ))
            }
        };

        if output.status.success() {
            tracing::info!(program = %self.program, "elevation granted");
            return Ok(());
        }

        let detail = last_line(&output.stderr);
        tracing::warn!(
            exit_code = ?output.status.code(),
            detail = %detail,
            "elevation refused"
        );
        Err(StartError::AuthenticationFailed {
            exit_code: output.status.code(),
            detail,
        })
    }

    /// Build `sudo -n <program> <args...>` for the already-granted mode.
    pub fn non_interactive(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("-n").arg(program).args(args);
        cmd
    }

    fn unavailable(&self, reason: String, source: Option<std::io::Error>) -> StartError {
        tracing::warn!(program = %self.program, reason = %reason, "elevation unavailable");
        StartError::ElevationUnavailable {
            program: self.program.clone(),
            reason,
            source,
        }
    }
}

/// Last non-empty line of a byte stream, lossily decoded.
fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}
