//! Thin subprocess wrapper implementing [`AgentHandle`].
//!
//! Runs the wrapped agent with piped stdio, forwards its output through an
//! optional line classifier, and reports the exit code. Prompt
//! classification itself is pluggable: the bridge consumes whatever
//! [`AgentEvent`]s the classifier produces.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentHandle};
use crate::config::AgentConfig;
use crate::error::TransportError;

/// Turns raw agent output lines into classified events.
pub type LineClassifier = Arc<dyn Fn(&str) -> Option<AgentEvent> + Send + Sync>;

pub struct ChildAgent {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    running: Arc<AtomicBool>,
    stop_token: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ChildAgent {
    /// Spawn the configured agent command. Output lines go through
    /// `classifier` into `events`; process exit is always reported as
    /// [`AgentEvent::Exited`].
    pub async fn spawn(
        config: &AgentConfig,
        initial_command: Option<&str>,
        events: mpsc::Sender<AgentEvent>,
        classifier: Option<LineClassifier>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut parts = config.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("agent command is empty"))?;

        let mut child: Child = Command::new(program)
            .args(parts)
            .current_dir(&config.working_directory)
            .envs(&config.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent stdout unavailable"))?;

        let running = Arc::new(AtomicBool::new(true));
        let stop_token = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        // Reader: forward agent output and classified events.
        {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    println!("{line}");
                    if let Some(classify) = &classifier
                        && let Some(event) = classify(&line)
                        && events.send(event).await.is_err()
                    {
                        break;
                    }
                }
            });
        }

        // Supervisor: owns the child, reports exit, honors stop.
        {
            let running = Arc::clone(&running);
            let token = stop_token.clone();
            tokio::spawn(async move {
                let code = tokio::select! {
                    status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
                    () = token.cancelled() => {
                        let _ = child.start_kill();
                        child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
                    }
                };
                running.store(false, Ordering::SeqCst);
                let _ = exit_tx.send(Some(code));
                let _ = events.send(AgentEvent::Exited { code }).await;
            });
        }

        let agent = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            running,
            stop_token,
            exit_rx,
        });

        if let Some(command) = initial_command
            && !agent.inject(&format!("{command}\n")).await
        {
            anyhow::bail!("failed to deliver initial command to agent");
        }

        Ok(agent)
    }
}

#[async_trait]
impl AgentHandle for ChildAgent {
    async fn inject(&self, text: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        let ok = stdin.write_all(text.as_bytes()).await.is_ok() && stdin.flush().await.is_ok();
        if !ok {
            tracing::warn!("agent stdin write failed");
        }
        ok
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        // Without a pty there is no line discipline to turn ETX into
        // SIGINT; this is best-effort for agents that read control bytes.
        if self.inject("\u{3}").await {
            Ok(())
        } else {
            Err(TransportError::Inject.into())
        }
    }

    async fn stop(&self, timeout: Duration) -> anyhow::Result<i32> {
        self.stop_token.cancel();
        let mut rx = self.exit_rx.clone();
        let code = tokio::time::timeout(timeout, async {
            loop {
                if let Some(code) = *rx.borrow() {
                    return code;
                }
                if rx.changed().await.is_err() {
                    return -1;
                }
            }
        })
        .await
        .unwrap_or(-1);
        // Drop our stdin handle so the child sees EOF even if kill raced.
        self.stdin.lock().await.take();
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::ChildAgent;
    use crate::agent::{AgentEvent, AgentHandle};
    use crate::config::AgentConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn cat_config() -> AgentConfig {
        AgentConfig {
            command: "cat".to_string(),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn spawn_inject_and_stop_round_trip() {
        let (tx, mut rx) = mpsc::channel(16);
        let agent = ChildAgent::spawn(&cat_config(), None, tx, None)
            .await
            .expect("spawn cat");
        assert!(agent.is_running());
        assert!(agent.inject("hello\n").await);

        let code = agent.stop(Duration::from_secs(5)).await.unwrap();
        // cat killed by signal reports no code; the wrapper maps that to -1.
        assert!(code == -1 || code == 0);

        // Exit is reported as an event.
        let mut saw_exit = false;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            match event {
                Some(AgentEvent::Exited { .. }) => {
                    saw_exit = true;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(saw_exit);
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let config = AgentConfig {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            ..AgentConfig::default()
        };
        let (tx, _rx) = mpsc::channel(4);
        assert!(ChildAgent::spawn(&config, None, tx, None).await.is_err());
    }
}
