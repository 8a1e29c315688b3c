use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::error::{error_codes, KeyCustodyError, KeyCustodyResult};
use crate::store::SystemSshKeyRecord;

/// State of a background generation
#[derive(Debug)]
pub enum JobStatus {
    Pending,
    Finished(KeyCustodyResult<SystemSshKeyRecord>),
}

/// Handle to a key generation running on its own thread.
///
/// The result is delivered once, to whichever of `poll` or `wait` sees it
/// first.
#[derive(Debug)]
pub struct GenerationJob {
    name: String,
    receiver: Receiver<KeyCustodyResult<SystemSshKeyRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl GenerationJob {
    pub(crate) fn spawn<F>(name: &str, work: F) -> KeyCustodyResult<Self>
    where
        F: FnOnce() -> KeyCustodyResult<SystemSshKeyRecord> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("keywarden-keygen-{}", name))
            .spawn(move || {
                // The receiver may have been dropped; nothing to report to then
                let _ = sender.send(work());
            })?;

        Ok(Self {
            name: name.to_string(),
            receiver,
            handle: Some(handle),
        })
    }

    /// Name of the key being generated
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking check for completion
    pub fn poll(&mut self) -> JobStatus {
        match self.receiver.try_recv() {
            Ok(result) => {
                self.join();
                JobStatus::Finished(result)
            }
            Err(TryRecvError::Empty) => JobStatus::Pending,
            Err(TryRecvError::Disconnected) => {
                self.join();
                JobStatus::Finished(Err(self.lost()))
            }
        }
    }

    /// Block until the generation finishes
    pub fn wait(mut self) -> KeyCustodyResult<SystemSshKeyRecord> {
        let result = self.receiver.recv().unwrap_or_else(|_| Err(self.lost()));
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Key generation worker for '{}' panicked", self.name);
            }
        }
    }

    fn lost(&self) -> KeyCustodyError {
        KeyCustodyError::generation_error(
            "background_generation",
            &format!("worker for '{}' exited without a result", self.name),
            error_codes::RSA_GENERATION_FAILED,
        )
    }
}
