// Startup handshake between a parent process and the distributor.
//
// The distributor prints one fixed marker line to stdout once bound. The
// parent scans the child's stdout line by line for the marker within a
// deadline: arbitrary preamble (warnings, banners) is ignored and no exact
// byte count is assumed.

use std::time::Duration;

use anyhow::{anyhow, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const READY_MARKER: &str = "JOBMON_DISTRIBUTOR_READY";

/// Print the marker on its own line and flush so a pipe reader sees it.
pub fn print_ready() {
    use std::io::Write;
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{}", READY_MARKER);
    let _ = stdout.flush();
}

/// Scan a child's stdout for the readiness marker. The marker may appear
/// anywhere on a line; everything before it is ignored.
pub async fn wait_for_ready<R>(stdout: R, timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let pattern = Regex::new(READY_MARKER).expect("static pattern");
    let mut lines = BufReader::new(stdout).lines();

    let scan = async {
        while let Some(line) = lines.next_line().await? {
            if pattern.is_match(&line) {
                return Ok(());
            }
            tracing::debug!(line = %line, "Distributor preamble");
        }
        Err(anyhow!("distributor stdout closed before readiness marker"))
    };

    match tokio::time::timeout(timeout, scan).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "distributor did not become ready within {:?}",
            timeout
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn marker_is_found_after_preamble() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            writer
                .write_all(b"warning: something benign\nbanner line\nJOBMON_DISTRIBUTOR_READY\n")
                .await
                .unwrap();
        });

        wait_for_ready(reader, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn marker_embedded_in_a_longer_line_still_matches() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            writer
                .write_all(b"2024-01-01 INFO JOBMON_DISTRIBUTOR_READY bound to run 7\n")
                .await
                .unwrap();
        });

        wait_for_ready(reader, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_without_marker_errors() {
        let (writer, reader) = tokio::io::duplex(1024);
        drop(writer);

        let err = wait_for_ready(reader, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (_writer, reader) = tokio::io::duplex(1024);

        let err = wait_for_ready(reader, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ready"));
    }
}
