//! Prometheus metrics for the redirection relay.
//!
//! Every family is labelled by redirection mode (`kvm`, `sol`, `ider`).
//! Counters cover bytes and message counts per direction; histograms cover
//! the time spent blocked on each I/O point and the payload size
//! distributions. Exported in text format at `GET /metrics`.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Buckets for I/O latency histograms, in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0,
];

/// Metrics recorded by the relay loops. Cheap to clone via the registry
/// handle; all inner types use interior mutability.
pub struct RedirectMetrics {
    registry: Registry,

    bytes_device_to_browser: IntCounterVec,
    bytes_browser_to_device: IntCounterVec,
    msgs_device_to_browser: IntCounterVec,
    msgs_browser_to_device: IntCounterVec,

    device_to_browser_write: HistogramVec,
    browser_to_device_send: HistogramVec,
    device_receive_block_seconds: HistogramVec,
    browser_read_block_seconds: HistogramVec,

    device_payload_bytes: HistogramVec,
    browser_payload_bytes: HistogramVec,
}

impl RedirectMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let mode = &["mode"];

        let bytes_device_to_browser = IntCounterVec::new(
            Opts::new(
                "bytes_device_to_browser_total",
                "Total bytes forwarded from AMT device to browser",
            ),
            mode,
        )?;
        let bytes_browser_to_device = IntCounterVec::new(
            Opts::new(
                "bytes_browser_to_device_total",
                "Total bytes forwarded from browser to AMT device",
            ),
            mode,
        )?;
        let msgs_device_to_browser = IntCounterVec::new(
            Opts::new(
                "msgs_device_to_browser_total",
                "Frames forwarded from AMT device to browser",
            ),
            mode,
        )?;
        let msgs_browser_to_device = IntCounterVec::new(
            Opts::new(
                "msgs_browser_to_device_total",
                "Frames forwarded from browser to AMT device",
            ),
            mode,
        )?;

        let device_to_browser_write = HistogramVec::new(
            HistogramOpts::new(
                "device_to_browser_write_seconds",
                "Time to write a device frame to the websocket",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            mode,
        )?;
        let browser_to_device_send = HistogramVec::new(
            HistogramOpts::new(
                "browser_to_device_send_seconds",
                "Time to send a browser frame to the device connection",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            mode,
        )?;
        let device_receive_block_seconds = HistogramVec::new(
            HistogramOpts::new(
                "device_receive_block_seconds",
                "Time blocked waiting for device data",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            mode,
        )?;
        let browser_read_block_seconds = HistogramVec::new(
            HistogramOpts::new(
                "browser_read_block_seconds",
                "Time blocked reading from the browser websocket",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            mode,
        )?;

        // powers of two, 64 B .. 64 KiB
        let payload_buckets = prometheus::exponential_buckets(64.0, 2.0, 11)?;
        let device_payload_bytes = HistogramVec::new(
            HistogramOpts::new(
                "device_payload_bytes",
                "Device payload sizes forwarded to browser",
            )
            .buckets(payload_buckets.clone()),
            mode,
        )?;
        let browser_payload_bytes = HistogramVec::new(
            HistogramOpts::new(
                "browser_payload_bytes",
                "Browser payload sizes forwarded to device",
            )
            .buckets(payload_buckets),
            mode,
        )?;

        for collector in [
            &bytes_device_to_browser,
            &bytes_browser_to_device,
            &msgs_device_to_browser,
            &msgs_browser_to_device,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }
        for collector in [
            &device_to_browser_write,
            &browser_to_device_send,
            &device_receive_block_seconds,
            &browser_read_block_seconds,
            &device_payload_bytes,
            &browser_payload_bytes,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }

        Ok(Self {
            registry,
            bytes_device_to_browser,
            bytes_browser_to_device,
            msgs_device_to_browser,
            msgs_browser_to_device,
            device_to_browser_write,
            browser_to_device_send,
            device_receive_block_seconds,
            browser_read_block_seconds,
            device_payload_bytes,
            browser_payload_bytes,
        })
    }

    /// One frame forwarded device → browser.
    pub fn device_to_browser(&self, mode: &str, payload_len: usize, write_time: Duration) {
        self.device_payload_bytes
            .with_label_values(&[mode])
            .observe(payload_len as f64);
        self.bytes_device_to_browser
            .with_label_values(&[mode])
            .inc_by(payload_len as u64);
        self.msgs_device_to_browser.with_label_values(&[mode]).inc();
        self.device_to_browser_write
            .with_label_values(&[mode])
            .observe(write_time.as_secs_f64());
    }

    /// One frame forwarded browser → device.
    pub fn browser_to_device(&self, mode: &str, payload_len: usize, send_time: Duration) {
        self.browser_payload_bytes
            .with_label_values(&[mode])
            .observe(payload_len as f64);
        self.bytes_browser_to_device
            .with_label_values(&[mode])
            .inc_by(payload_len as u64);
        self.msgs_browser_to_device.with_label_values(&[mode]).inc();
        self.browser_to_device_send
            .with_label_values(&[mode])
            .observe(send_time.as_secs_f64());
    }

    /// Time the device loop spent blocked in `receive`.
    pub fn device_receive_block(&self, mode: &str, blocked: Duration) {
        self.device_receive_block_seconds
            .with_label_values(&[mode])
            .observe(blocked.as_secs_f64());
    }

    /// Time the browser loop spent blocked reading the websocket.
    pub fn browser_read_block(&self, mode: &str, blocked: Duration) {
        self.browser_read_block_seconds
            .with_label_values(&[mode])
            .observe(blocked.as_secs_f64());
    }

    /// All families in Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| prometheus::Error::Msg(format!("metrics output not UTF-8: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn msgs_device_to_browser_count(&self, mode: &str) -> u64 {
        self.msgs_device_to_browser.with_label_values(&[mode]).get()
    }

    #[cfg(test)]
    pub(crate) fn msgs_browser_to_device_count(&self, mode: &str) -> u64 {
        self.msgs_browser_to_device.with_label_values(&[mode]).get()
    }

    #[cfg(test)]
    pub(crate) fn bytes_device_to_browser_count(&self, mode: &str) -> u64 {
        self.bytes_device_to_browser
            .with_label_values(&[mode])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_per_mode_traffic() {
        let m = RedirectMetrics::new().unwrap();

        m.device_to_browser("kvm", 1024, Duration::from_millis(2));
        m.device_to_browser("kvm", 512, Duration::from_millis(1));
        m.device_to_browser("sol", 16, Duration::from_millis(1));
        m.browser_to_device("kvm", 64, Duration::from_millis(1));

        assert_eq!(m.msgs_device_to_browser_count("kvm"), 2);
        assert_eq!(m.msgs_device_to_browser_count("sol"), 1);
        assert_eq!(m.msgs_browser_to_device_count("kvm"), 1);
        assert_eq!(m.bytes_device_to_browser_count("kvm"), 1536);
    }

    #[test]
    fn text_encoding_contains_every_family() {
        let m = RedirectMetrics::new().unwrap();
        m.device_to_browser("kvm", 128, Duration::from_millis(1));
        m.browser_to_device("kvm", 128, Duration::from_millis(1));
        m.device_receive_block("kvm", Duration::from_millis(5));
        m.browser_read_block("kvm", Duration::from_millis(5));

        let out = m.encode_text().unwrap();
        for family in [
            "bytes_device_to_browser_total",
            "bytes_browser_to_device_total",
            "msgs_device_to_browser_total",
            "msgs_browser_to_device_total",
            "device_to_browser_write_seconds",
            "browser_to_device_send_seconds",
            "device_receive_block_seconds",
            "browser_read_block_seconds",
            "device_payload_bytes",
            "browser_payload_bytes",
        ] {
            assert!(out.contains(family), "missing {family}");
        }
    }
}
