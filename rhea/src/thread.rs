//! Daemon threads with their own cancellable context.

use std::thread::{self, JoinHandle};

use crate::context::{Context, ContextHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::trace::warn;

/// A named long-lived worker thread.
///
/// The body runs under a fresh context parented (through a context held
/// by the spawner) to the process top, so cancelling
/// [`context`](DaemonThread::context) unblocks any `select` the body is
/// suspended in. `cancelled` and `deadline_exceeded` escaping the body
/// are the normal cooperative exit paths and are swallowed.
pub struct DaemonThread {
    /// Parent of the thread's own context. Dropping it waits until the
    /// thread's context detaches, which happens when the body returns.
    parent: Context,
    handle: Option<JoinHandle<()>>,
}

impl DaemonThread {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let parent = Context::with_options(&Context::top(), false, false)?;
        let parent_handle = parent.handle().clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _ctx = match Context::with_options(&parent_handle, true, false) {
                    Ok(ctx) => ctx,
                    Err(_e) => {
                        warn!(error = %_e, "failed to enter worker thread context");
                        return;
                    }
                };
                if let Err(e) = body() {
                    // Cooperative exits on shutdown.
                    if !matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::DeadlineExceeded) {
                        warn!(error = %e, "worker exited with error");
                    }
                }
            })
            .map_err(|e| Error::io(format!("failed to spawn thread {name}: {e}")))?;
        Ok(Self { parent, handle: Some(handle) })
    }

    /// Handle for cancelling the thread's context tree.
    pub fn context(&self) -> ContextHandle {
        self.parent.handle().clone()
    }

    /// Waits for the thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DaemonThread {
    fn drop(&mut self) {
        self.parent.cancel();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::never;
    use crate::select::select;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn cancel_unblocks_a_suspended_body() {
        let exited = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&exited);
        let mut worker = DaemonThread::spawn("rhea-test-worker", move || {
            let result = select((never(),));
            seen.store(true, Ordering::SeqCst);
            result.map(|_| ())
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!exited.load(Ordering::SeqCst));
        worker.context().cancel();
        worker.join();
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_cancels_and_joins() {
        let worker = DaemonThread::spawn("rhea-test-drop", move || {
            let _ = select((never(),));
            Ok(())
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        drop(worker);
    }
}
