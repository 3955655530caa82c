//! Progress: draining the transport and retrying deferred local work.

use super::RmaProcess;
use crate::config::ProgressMode;
use crate::error::Result;
use crate::transport::Transport;
use crate::utils::busy_wait;

impl<T: Transport> RmaProcess<T> {
    /// Handle at most `poke_batch` ready deliveries without blocking.
    ///
    /// Return the number handled.
    pub fn poke(&mut self) -> Result<usize> {
        let mut handled = 0;
        while handled < self.config.poke_batch {
            let Some(delivery) = self.transport.poll()? else {
                break;
            };
            self.dispatch(delivery)?;
            handled += 1;
        }
        self.retry_local_locks()?;
        Ok(handled)
    }

    /// Block for one delivery and handle it.
    pub fn wait_progress(&mut self) -> Result<()> {
        let delivery = self.transport.wait()?;
        self.dispatch(delivery)?;
        self.retry_local_locks()
    }

    fn has_local_retry(&self) -> bool {
        self.windows.values().any(|w| w.local_retry.is_some())
    }

    /// Drive progress until `done` holds.
    pub(crate) fn progress_until(
        &mut self,
        mut done: impl FnMut(&mut Self) -> Result<bool>,
    ) -> Result<()> {
        loop {
            if done(self)? {
                return Ok(());
            }
            match self.config.progress {
                ProgressMode::Poke { backoff_nanos } => {
                    if self.poke()? == 0 {
                        busy_wait(backoff_nanos);
                    }
                }
                ProgressMode::Wait if self.has_local_retry() => {
                    self.poke()?;
                }
                ProgressMode::Wait => self.wait_progress()?,
            }
        }
    }
}
