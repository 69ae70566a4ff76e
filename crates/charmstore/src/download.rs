//! Disposable, cancellable HTTP fetch into a temp file.
//!
//! A download runs on its own worker thread and delivers exactly one result
//! on a single-shot channel: an opened temp file the caller now owns, or an
//! error. [`Download::stop`] cancels the fetch; whichever of delivery and
//! cancellation wins, a cancelled download never leaves a partial file
//! behind (the temp file is removed when dropped unpersisted).

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// An in-flight (or finished) download.
pub struct Download {
    rx: Receiver<Result<NamedTempFile>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Download {
    /// Start fetching `url` into a temp file under `dir`.
    pub fn start(url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let dir = dir.into();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let worker_cancel = Arc::clone(&cancel);
        let worker = std::thread::spawn(move || run_fetch(&url, &dir, &worker_cancel, &tx));

        Self {
            rx,
            cancel,
            worker: Some(worker),
        }
    }

    /// The single-shot delivery channel.
    ///
    /// Receives exactly one value unless the download is stopped first. The
    /// delivered file is owned by the caller: it is removed on drop, or kept
    /// via [`NamedTempFile::persist`].
    pub fn done(&self) -> &Receiver<Result<NamedTempFile>> {
        &self.rx
    }

    /// Block until the download delivers.
    pub fn wait(mut self) -> Result<NamedTempFile> {
        let result = self
            .rx
            .recv()
            .context("download worker exited without delivering")?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        result
    }

    /// Cancel the download and discard anything it produced.
    ///
    /// Blocks until the worker has finished; afterwards no partial file
    /// remains on disk.
    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // If delivery raced ahead of cancellation, drop the delivered file
        // so it is removed.
        while self.rx.try_recv().is_ok() {}
    }
}

fn run_fetch(url: &str, dir: &Path, cancel: &AtomicBool, tx: &Sender<Result<NamedTempFile>>) {
    match fetch(url, dir, cancel) {
        // Cancelled: deliver nothing; the dropped temp file is removed.
        Ok(None) => {}
        Ok(Some(file)) => {
            let _ = tx.send(Ok(file));
        }
        Err(err) => {
            let _ = tx.send(Err(err));
        }
    }
}

/// Fetch `url` into a temp file, checking for cancellation between chunks.
fn fetch(url: &str, dir: &Path, cancel: &AtomicBool) -> Result<Option<NamedTempFile>> {
    if cancel.load(Ordering::SeqCst) {
        return Ok(None);
    }

    let mut response = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("failed to fetch {url}"))?;

    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create download file in {}", dir.display()))?;

    let mut buf = [0u8; 32 * 1024];
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let n = response
            .read(&mut buf)
            .with_context(|| format!("failed reading body of {url}"))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .context("failed to write download file")?;
    }

    file.flush().context("failed to flush download file")?;
    file.rewind().context("failed to rewind download file")?;
    Ok(Some(file))
}
