// src/io.rs
//! Asynchronous read engine.
//!
//! A single I/O thread consumes read submissions from a bounded channel (the
//! bound doubles as the in-flight cap) and fulfils them with positional
//! reads through a reusable staging buffer, so one oversized request never
//! holds a transient allocation bigger than the staging window. Workers
//! either fire-and-forget with a completion callback or block on
//! [`IoEngine::read_blocking`] while they overlap decompression of earlier
//! requests.
//!
//! The positional-read primitive itself lives behind
//! [`crate::reader::RandomAccessFile`], so a platform async facility (or a
//! test double) can slot in without touching the engine.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::reader::{read_exact_at, RandomAccessFile};

/// Upper bound on queued-plus-running read submissions.
pub const MAX_INFLIGHT_READS: usize = 64;
/// Size of the I/O thread's staging buffer.
pub const STAGING_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

struct ReadSubmission {
    file: Arc<dyn RandomAccessFile>,
    offset: u64,
    len: usize,
    completion: ReadCompletion,
}

enum IoMessage {
    Read(ReadSubmission),
    Shutdown,
}

pub struct IoEngine {
    tx: Sender<IoMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoEngine {
    pub fn spawn() -> Self {
        let (tx, rx) = bounded::<IoMessage>(MAX_INFLIGHT_READS);
        let thread = std::thread::Builder::new()
            .name("zh-io".to_string())
            .spawn(move || {
                let mut staging = vec![0u8; STAGING_BUFFER_SIZE];
                while let Ok(message) = rx.recv() {
                    match message {
                        IoMessage::Read(sub) => {
                            let result =
                                read_with_staging(sub.file.as_ref(), sub.offset, sub.len, &mut staging);
                            (sub.completion)(result);
                        }
                        IoMessage::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn I/O thread");
        Self {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Queue a read; the completion runs on the I/O thread. Blocks if the
    /// in-flight cap is reached. After shutdown the completion fires
    /// immediately with [`StreamError::Shutdown`].
    pub fn submit(
        &self,
        file: Arc<dyn RandomAccessFile>,
        offset: u64,
        len: usize,
        completion: ReadCompletion,
    ) {
        let submission = ReadSubmission {
            file,
            offset,
            len,
            completion,
        };
        if let Err(err) = self.tx.send(IoMessage::Read(submission)) {
            if let IoMessage::Read(sub) = err.into_inner() {
                (sub.completion)(Err(StreamError::Shutdown));
            }
        }
    }

    /// Submit and wait for the bytes.
    pub fn read_blocking(
        &self,
        file: Arc<dyn RandomAccessFile>,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let (done_tx, done_rx) = bounded(1);
        self.submit(
            file,
            offset,
            len,
            Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        );
        done_rx.recv().map_err(|_| StreamError::Shutdown)?
    }

    /// Stop the I/O thread after the queue drains. Idempotent.
    pub fn shutdown(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let _ = self.tx.send(IoMessage::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_with_staging(
    file: &dyn RandomAccessFile,
    offset: u64,
    len: usize,
    staging: &mut [u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut done = 0usize;
    while done < len {
        let chunk = (len - done).min(staging.len());
        read_exact_at(file, offset + done as u64, &mut staging[..chunk])?;
        out.extend_from_slice(&staging[..chunk]);
        done += chunk;
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
