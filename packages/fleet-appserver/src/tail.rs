//! `tail -f` emulation for streaming worker output to a client socket.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Poll interval while waiting for the file to appear or grow.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Follows `path`, copying appended bytes into `sink` until `stop` is set
/// and no new data remains.
pub async fn tail_follow<W>(path: PathBuf, mut sink: W, mut stop: watch::Receiver<bool>)
where
    W: AsyncWrite + Unpin,
{
    let mut position = 0usize;
    loop {
        match tokio::fs::read(&path).await {
            Ok(data) if data.len() > position => {
                if sink.write_all(&data[position..]).await.is_err() {
                    return;
                }
                position = data.len();
                continue;
            }
            _ => {}
        }

        if *stop.borrow() {
            let _ = sink.flush().await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = stop.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn follows_appends_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_stdout");
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut sink = Vec::new();
        let handle = {
            let path = path.clone();
            tokio::spawn(async move {
                tail_follow(path, &mut sink, stop_rx).await;
                sink
            })
        };

        // file appears after the follower starts
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, b"first\n").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        std::fs::write(&path, b"first\nsecond\n").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        stop_tx.send(true).unwrap();
        let sink = handle.await.unwrap();
        assert_eq!(sink, b"first\nsecond\n");
    }
}
