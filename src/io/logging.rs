//! Logging wrapper for `IoProvider` implementations. Grounded on the
//! teacher's `LoggingDisplay` decorator, extended to the full command set.

use super::{IoCommand, IoProvider, IoResult, ProviderCapabilities};
use log::info;

pub struct LoggingIoProvider {
    inner: Box<dyn IoProvider>,
    op_count: usize,
}

impl LoggingIoProvider {
    pub fn new(inner: Box<dyn IoProvider>) -> Self {
        info!("=== I/O LOGGING STARTED ===");
        Self { inner, op_count: 0 }
    }

    fn log_op(&mut self, cmd: &IoCommand) {
        self.op_count += 1;
        info!("[IO {:04}] {:?}", self.op_count, cmd);
    }
}

impl IoProvider for LoggingIoProvider {
    fn command(&mut self, cmd: IoCommand) -> IoResult {
        self.log_op(&cmd);
        self.inner.command(cmd)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }
}

impl Drop for LoggingIoProvider {
    fn drop(&mut self) {
        info!("=== I/O LOGGING ENDED ({} operations) ===", self.op_count);
    }
}
