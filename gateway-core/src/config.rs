//! Configuration for a session pipe

use std::time::Duration;

use crate::pipe::PipeError;

/// Pipe configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConfig {
    /// How long the pipe waits for a response before abandoning a call
    pub response_timeout: Duration,

    /// Number of previously used charge station call ids remembered for
    /// reuse detection
    pub message_id_buffer_len: usize,

    /// Capacity of the channel carrying CSMS messages into the pipe
    pub csms_message_queue_len: usize,

    /// Maximum number of CSMS calls held back while a charge station call
    /// is outstanding
    pub csms_call_queue_len: usize,

    /// Number of forwarded CSMS calls remembered so that late responses can
    /// still be matched
    pub csms_call_response_buffer_len: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            message_id_buffer_len: 10,
            csms_message_queue_len: 5,
            csms_call_queue_len: 5,
            csms_call_response_buffer_len: 5,
        }
    }
}

impl PipeConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_message_id_buffer_len(mut self, len: usize) -> Self {
        self.message_id_buffer_len = len;
        self
    }

    pub fn with_csms_message_queue_len(mut self, len: usize) -> Self {
        self.csms_message_queue_len = len;
        self
    }

    /// A length of zero drops every CSMS call that arrives while the
    /// charge station has a call outstanding
    pub fn with_csms_call_queue_len(mut self, len: usize) -> Self {
        self.csms_call_queue_len = len;
        self
    }

    pub fn with_csms_call_response_buffer_len(mut self, len: usize) -> Self {
        self.csms_call_response_buffer_len = len;
        self
    }

    /// Check the lengths that back channels and rings
    pub fn validate(&self) -> Result<(), PipeError> {
        let non_zero = [
            ("message_id_buffer_len", self.message_id_buffer_len),
            ("csms_message_queue_len", self.csms_message_queue_len),
            (
                "csms_call_response_buffer_len",
                self.csms_call_response_buffer_len,
            ),
        ];

        for (name, value) in non_zero {
            if value == 0 {
                return Err(PipeError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        if self.response_timeout.is_zero() {
            return Err(PipeError::InvalidConfig(
                "response_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
