use crate::error::{GenerationError, GenerationResult};
use codeprompt_assembler::{RenderJob, RenderOutcome};
use codeprompt_protocol::CachedArtifact;
use log::debug;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

pub const WORKER_SUBCOMMAND: &str = "render-worker";

/// Render `job` in a child `codeprompt render-worker` process.
///
/// The child gets a private copy of the content snapshot, so a hung or
/// crashed render never touches shared state. It is killed when the
/// timeout fires.
pub async fn render_in_worker(
    exe: &Path,
    job: &RenderJob,
    limit: Duration,
) -> GenerationResult<CachedArtifact> {
    let mut payload = Vec::new();
    job.write_to(&mut payload)
        .map_err(|err| GenerationError::WorkerFailed(err.to_string()))?;

    let mut child = Command::new(exe)
        .args(["--quiet", WORKER_SUBCOMMAND])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            GenerationError::WorkerFailed(format!("cannot start {}: {err}", exe.display()))
        })?;
    debug!(
        "Render worker {:?} started for {} files ({} bytes of input)",
        child.id(),
        job.selection.len(),
        payload.len()
    );

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| GenerationError::WorkerFailed("worker stdin unavailable".to_string()))?;

    let exchange = async move {
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);
        child.wait_with_output().await
    };

    let output = match timeout(limit, exchange).await {
        Ok(result) => result?,
        Err(_) => return Err(GenerationError::ProcessPoolTimeout(limit)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GenerationError::WorkerFailed(format!(
            "worker exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let outcome: RenderOutcome = serde_json::from_slice(&output.stdout)
        .map_err(|err| GenerationError::WorkerFailed(format!("unreadable worker reply: {err}")))?;
    outcome.into_result().map_err(GenerationError::WorkerFailed)
}

/// Child side: one JSON job in, one JSON outcome out.
pub fn run_render_worker(reader: impl Read, mut writer: impl Write) -> anyhow::Result<()> {
    let outcome = match RenderJob::read_from(reader) {
        Ok(job) => RenderOutcome::from(job.render()),
        Err(err) => RenderOutcome::Failed {
            reason: format!("invalid job: {err}"),
        },
    };
    serde_json::to_writer(&mut writer, &outcome)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeprompt_protocol::{ContentEntry, FileContent};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn worker_protocol_renders_job_from_reader() {
        let mut files = HashMap::new();
        files.insert(
            "a.py".to_string(),
            ContentEntry {
                path: "a.py".to_string(),
                content: FileContent::Loaded(Arc::from("x")),
                size: 1,
                mtime: 1,
            },
        );
        let job = RenderJob {
            selection: vec!["a.py".to_string()],
            template: "{{file_contents}}".to_string(),
            max_content_size: 100,
            files,
            ..RenderJob::default()
        };
        let mut input = Vec::new();
        job.write_to(&mut input).unwrap();

        let mut output = Vec::new();
        run_render_worker(input.as_slice(), &mut output).unwrap();
        let outcome: RenderOutcome = serde_json::from_slice(&output).unwrap();
        let artifact = outcome.into_result().unwrap();
        assert!(artifact.prompt.contains("--- a.py ---\nx\n--- a.py ---"));
    }

    #[test]
    fn garbage_input_reports_failure() {
        let mut output = Vec::new();
        run_render_worker(&b"not json"[..], &mut output).unwrap();
        let outcome: RenderOutcome = serde_json::from_slice(&output).unwrap();
        assert!(outcome.into_result().unwrap_err().starts_with("invalid job"));
    }

    #[tokio::test]
    async fn missing_executable_is_worker_failure() {
        let result = render_in_worker(
            Path::new("/definitely/not/a/codeprompt"),
            &RenderJob::default(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(GenerationError::WorkerFailed(_))));
    }
}
