use std::sync::{Mutex, PoisonError};

use super::Job;

/// In-memory job that records everything sent to it.
#[derive(Debug, Default)]
pub struct MockJob {
    payload: Vec<u8>,
    handle: String,
    function: String,
    data: Mutex<Vec<u8>>,
    warnings: Mutex<Vec<Vec<u8>>>,
    status: Mutex<Option<(u32, u32)>>,
}

impl MockJob {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = handle.into();
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    /// Everything sent through `send_data`, concatenated
    pub fn out_data(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn out_string(&self) -> String {
        String::from_utf8_lossy(&self.out_data()).into_owned()
    }

    pub fn warnings(&self) -> Vec<Vec<u8>> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last reported (numerator, denominator)
    pub fn status(&self) -> Option<(u32, u32)> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Job for MockJob {
    fn data(&self) -> &[u8] {
        &self.payload
    }

    fn handle(&self) -> &str {
        &self.handle
    }

    fn function_name(&self) -> &str {
        &self.function
    }

    fn send_data(&self, data: &[u8]) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    fn send_warning(&self, data: &[u8]) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
    }

    fn update_status(&self, numerator: u32, denominator: u32) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some((numerator, denominator));
    }
}
