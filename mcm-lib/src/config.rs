use std::time::Duration;

/// Tunables for a [`Session`](crate::Session).
///
/// The defaults match the timings the MCM firmware is built around; tests shorten
/// them or run on tokio's paused clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause before the bulk receiver retries after a failed transfer
    pub receiver_backoff: Duration,
    /// How long `stop_bulk_receiver` waits before force-closing the transport
    pub receiver_stop_grace: Duration,
    /// Pause between bulk reads that returned no data while waiting for a line
    pub line_poll_interval: Duration,
    /// Length requested for every bulk IN transfer
    pub bulk_read_len: usize,
    /// Response timeout of LIN frame requests
    pub lin_response_timeout: Duration,
    /// Response timeout of the PPM bootloader action
    pub bootload_response_timeout: Duration,
    /// Timeout for the acknowledgement following each firmware chunk
    pub ota_ack_timeout: Duration,
    /// Timeout for the image validation verdict after the last chunk
    pub ota_validation_timeout: Duration,
    /// Timeout for the device to finish processing a hex file
    pub hex_processing_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receiver_backoff: Duration::from_millis(200),
            receiver_stop_grace: Duration::from_millis(300),
            line_poll_interval: Duration::from_millis(50),
            bulk_read_len: 512,
            lin_response_timeout: Duration::from_secs(1),
            bootload_response_timeout: Duration::from_secs(10),
            ota_ack_timeout: Duration::from_secs(10),
            ota_validation_timeout: Duration::from_secs(60),
            hex_processing_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn with_bulk_read_len(mut self, len: usize) -> Self {
        self.bulk_read_len = len;
        self
    }

    pub fn with_receiver_timing(mut self, backoff: Duration, stop_grace: Duration) -> Self {
        self.receiver_backoff = backoff;
        self.receiver_stop_grace = stop_grace;
        self
    }

    pub fn with_line_poll_interval(mut self, interval: Duration) -> Self {
        self.line_poll_interval = interval;
        self
    }

    /// Apply one timeout to every line/response wait. Handy for tests and slow links.
    pub fn with_response_timeouts(mut self, timeout: Duration) -> Self {
        self.lin_response_timeout = timeout;
        self.bootload_response_timeout = timeout;
        self.ota_ack_timeout = timeout;
        self.ota_validation_timeout = timeout;
        self.hex_processing_timeout = timeout;
        self
    }
}
