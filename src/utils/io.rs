use std::sync::{Arc, Mutex};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinHandle,
};

/// Output of a child process, collected by background tasks.
///
/// Several streams (stdout and stderr) can be drained into the same buffer, which gives the
/// combined output in roughly the order it was produced.
#[derive(Debug)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl Default for BackgroundIoHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundIoHandle {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(4096))),
            readers: Vec::new(),
        }
    }

    /// Spawns a task that appends everything read from `src` to the shared buffer.
    pub fn read_background<R: AsyncRead + Unpin + Send + 'static>(&mut self, mut src: R) {
        let buf = Arc::clone(&self.buf);
        let handle = tokio::spawn(async move {
            let mut chunk = vec![0_u8; 1024 * 16];
            loop {
                match src.read(&mut chunk[..]).await {
                    Ok(0) => break,
                    Ok(sz) => {
                        if let Ok(mut shared_buf) = buf.lock() {
                            shared_buf.extend_from_slice(&chunk[..sz]);
                        }
                    }
                    Err(e) => {
                        log::debug!("background read stopped: {}", e);
                        break;
                    }
                }
            }
        });
        self.readers.push(handle);
    }

    /// Snapshot of everything read so far.
    pub fn current_data(&self) -> Vec<u8> {
        self.buf.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Waits until every stream reached EOF, then returns the whole output.
    ///
    /// Only call this after the writer side is gone (the child exited or was killed),
    /// otherwise it waits as long as the child keeps its pipes open.
    pub async fn wait_finish(&mut self) -> Vec<u8> {
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        self.current_data()
    }
}

impl Drop for BackgroundIoHandle {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
