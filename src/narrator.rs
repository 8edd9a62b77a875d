use crate::error::{ExternalError, classify};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Optional natural-language generation used to enrich chat summaries.
pub trait Narrator {
    fn narrate(&self, prompt: &str) -> Result<String, ExternalError>;
}

/// Pipes the prompt to a shell command and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandNarrator {
    command: String,
}

impl CommandNarrator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Narrator for CommandNarrator {
    fn narrate(&self, prompt: &str) -> Result<String, ExternalError> {
        debug!(command = %self.command, "running narrator");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| classify(None, &format!("spawn narrator: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a command that ignores its input closes the pipe early
            if let Err(err) = stdin.write_all(prompt.as_bytes()) {
                debug!(error = %err, "narrator did not read the whole prompt");
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|err| classify(None, &format!("wait for narrator: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(output.status.code(), &stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(ExternalError::other("narrator produced no output"));
        }
        Ok(text)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn stdout_becomes_the_narration() {
        let narrator = CommandNarrator::new("tr a-z A-Z");
        assert_eq!(narrator.narrate("three cycles").unwrap(), "THREE CYCLES");
    }

    #[test]
    fn exit_status_is_classified() {
        let narrator = CommandNarrator::new("echo 'connection refused' >&2; exit 1");
        let err = narrator.narrate("hi").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkUnavailable);

        let err = CommandNarrator::new("exit 77").narrate("hi").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[test]
    fn empty_output_is_an_error() {
        let err = CommandNarrator::new("cat > /dev/null").narrate("hi").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Other);
    }
}
