//! Real encoder subprocesses backed by `tokio::process`.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use pagecast_core::{EncoderChild, EncoderProcess, EncoderSpawner, StreamError};
use tokio::process::{Child, Command};
use tracing::info;

/// Spawns the encoder with piped stdin/stderr. Stdout is unused.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl EncoderSpawner for ProcessSpawner {
    fn spawn(&self, program: &str, args: &[String]) -> Result<EncoderChild, StreamError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::EncoderSpawn(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::EncoderSpawn("stdin was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StreamError::EncoderSpawn("stderr was not captured".into()))?;

        info!(pid = ?child.id(), program, "Encoder process spawned");

        Ok(EncoderChild {
            stdin: Box::new(stdin),
            stderr: Box::new(stderr),
            process: Box::new(TokioProcess { child }),
        })
    }
}

pub struct TokioProcess {
    child: Child,
}

#[async_trait]
impl EncoderProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // `id()` is None once the child has been reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let mut child = ProcessSpawner.spawn("sh", &sh("exit 3")).unwrap();
        assert_eq!(child.process.wait().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn exits_when_stdin_closes() {
        let mut child = ProcessSpawner.spawn("sh", &sh("cat > /dev/null")).unwrap();
        child.stdin.write_all(b"frame bytes").await.unwrap();
        drop(child.stdin);
        assert_eq!(child.process.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn sigterm_ends_process_without_code() {
        let mut child = ProcessSpawner.spawn("sleep", &["30".to_string()]).unwrap();
        assert!(child.process.id().is_some());
        child.process.terminate().unwrap();
        assert_eq!(child.process.wait().await.unwrap(), None);
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(async {
            ProcessSpawner
                .spawn("/definitely/not/an/encoder", &[])
                .map(|_| ())
        });
        assert!(matches!(result, Err(StreamError::EncoderSpawn(_))));
    }
}
