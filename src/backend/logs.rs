use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;
use tracing::info;

const TAIL_MAX_LINES: usize = 200;

/// Most recent backend output lines, shared between drain tasks and the supervisor.
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogTail {
    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push_back(line);
            while lines.len() > TAIL_MAX_LINES {
                lines.pop_front();
            }
        }
    }

    /// Up to `limit` newest lines, oldest first.
    pub fn last(&self, limit: usize) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| {
                let start = lines.len().saturating_sub(limit);
                lines.iter().skip(start).cloned().collect()
            })
            .unwrap_or_default()
    }
}

/// Forward every line of `reader` to the log until EOF.
///
/// Runs detached for the lifetime of the child; it never blocks on consumers, so a slow
/// terminal cannot stall the backend's output pipe. Invalid UTF-8 is decoded lossily and
/// only EOF or a read error ends the loop, so the pipe stays open while the child lives.
pub fn spawn_drain<R>(
    stream_name: &'static str,
    reader: R,
    tail: LogTail,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    info!(target: "cellpose_cli::backend::output", "[{stream_name}] {line}");
                    tail.push(format!("[{stream_name}] {line}"));
                }
                Err(e) => {
                    warn!(stream = stream_name, error = %e, "backend output read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_is_bounded() {
        let tail = LogTail::default();
        for i in 0..(TAIL_MAX_LINES + 10) {
            tail.push(format!("line {i}"));
        }
        let all = tail.last(usize::MAX);
        assert_eq!(all.len(), TAIL_MAX_LINES);
        assert_eq!(all[0], "line 10");
        assert_eq!(tail.last(2), vec![
            format!("line {}", TAIL_MAX_LINES + 8),
            format!("line {}", TAIL_MAX_LINES + 9),
        ]);
    }

    #[tokio::test]
    async fn drain_collects_lines_until_eof() {
        let tail = LogTail::default();
        let input: &[u8] = b"Uvicorn running on http://127.0.0.1:8000\nready\n";
        spawn_drain("stdout", input, tail.clone()).await.unwrap();
        assert_eq!(
            tail.last(10),
            vec![
                "[stdout] Uvicorn running on http://127.0.0.1:8000".to_string(),
                "[stdout] ready".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn drain_survives_invalid_utf8() {
        let tail = LogTail::default();
        let input: &[u8] = b"booting\n\xff\xfe progress\nUvicorn running\n";
        spawn_drain("stdout", input, tail.clone()).await.unwrap();
        let lines = tail.last(10);
        assert_eq!(lines.len(), 3, "{lines:?}");
        assert_eq!(lines[0], "[stdout] booting");
        assert!(lines[1].ends_with(" progress"));
        assert_eq!(lines[2], "[stdout] Uvicorn running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_writing_garbage_is_not_killed_by_closed_pipe() {
        use std::process::Stdio;

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "printf '\\377\\n'; head -c 262144 /dev/zero | tr '\\0' 'x'; echo; echo done"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let tail = LogTail::default();
        let drain = spawn_drain("stdout", child.stdout.take().unwrap(), tail.clone());
        let status = child.wait().await.unwrap();
        drain.await.unwrap();
        assert!(status.success(), "{status:?}");
        assert_eq!(tail.last(1), vec!["[stdout] done".to_string()]);
    }
}
