//! Device session: configuration handshake and measurement acquisition.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AckStatus, ConfigFrame, InjectionConfig, verify_ack};
use crate::constants::{
    ACK_FRAME_LEN, CONFIG_SETTLE, DEFAULT_FLUSH_TIMEOUT, DEFAULT_LINK_TIMEOUT, POLL_TIMEOUT,
    REQUEST_MEASURE_CMD, RX_BUFFER_FLOOR, SEND_RETRY_ATTEMPTS, SEND_RETRY_DELAY,
};
use crate::error::ResistEsError;
use crate::frame::{RawMeasurement, required_frame_len};
use crate::link::Link;
use crate::measure::{RealMeasurement, field_names, format_row};
use crate::sink::MeasurementSink;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on collecting a configuration acknowledgement.
    pub ack_timeout: Duration,
    /// Bound on draining stale bytes before a configuration.
    pub flush_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            ack_timeout: DEFAULT_LINK_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

/// Control messages for a running acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireSignal {
    /// Ask the instrument for an immediate measurement.
    RequestMeasure,
    /// Finish the acquisition loop.
    Stop,
}

/// Per-acquisition choices.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Prefix every row with a UTC date column.
    pub timestamps: bool,
    /// How long one loop turn waits for measurement bytes.
    pub poll_timeout: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        AcquireOptions {
            timestamps: false,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// Counters reported when an acquisition ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireStats {
    pub frames_written: u64,
    pub frames_rejected: u64,
    pub bytes_dropped: u64,
}

/// One session with a ResistES instrument.
///
/// Owns the link and the reception buffer. Measurement decoding needs the
/// channel count, so it is available only after a configuration has been
/// acknowledged.
pub struct ResistEs {
    link: Box<dyn Link>,
    rx: BytesMut,
    options: SessionOptions,
    config: Option<InjectionConfig>,
    // rx length already examined and rejected, skip until it changes
    rx_checked: usize,
    rejected_frames: u64,
    dropped_bytes: u64,
}

impl ResistEs {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self::with_options(link, SessionOptions::default())
    }

    pub fn with_options(link: Box<dyn Link>, options: SessionOptions) -> Self {
        ResistEs {
            link,
            rx: BytesMut::new(),
            options,
            config: None,
            rx_checked: 0,
            rejected_frames: 0,
            dropped_bytes: 0,
        }
    }

    /// Last acknowledged configuration, if any.
    pub fn config(&self) -> Option<InjectionConfig> {
        self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Bytes waiting in the reception buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.rx.len()
    }

    /// Measurement candidates rejected so far.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    /// Bytes discarded by the reception buffer cap.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    async fn send_with_retry(&mut self, data: &[u8]) -> Result<(), ResistEsError> {
        let mut attempt = 1;
        loop {
            match self.link.send(data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SEND_RETRY_ATTEMPTS => {
                    warn!(attempt, error = %e, "send failed, retrying");
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain whatever the instrument pushed while nobody was listening.
    ///
    /// Returns once a poll comes back empty; a stream that keeps producing
    /// past the flush bound is an error.
    pub async fn flush(&mut self) -> Result<(), ResistEsError> {
        let started = tokio::time::Instant::now();
        let mut chunk = [0u8; 1024];
        let mut drained = 0usize;
        loop {
            let n = self.link.receive(&mut chunk, POLL_TIMEOUT).await?;
            if n == 0 {
                if drained > 0 {
                    debug!(bytes = drained, "drained stale bytes");
                }
                self.rx.clear();
                self.rx_checked = 0;
                return Ok(());
            }
            drained += n;
            if started.elapsed() > self.options.flush_timeout {
                return Err(ResistEsError::FlushTimeout(self.options.flush_timeout));
            }
        }
    }

    /// Collect up to `want` bytes, stopping at the deadline. May come back
    /// short; the caller decides what that means.
    async fn collect_exact(
        &mut self,
        want: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ResistEsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(want);
        let mut chunk = [0u8; 64];
        while out.len() < want {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let cap = (want - out.len()).min(chunk.len());
            let n = self
                .link
                .receive(&mut chunk[..cap], remaining.min(POLL_TIMEOUT))
                .await?;
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Configure the instrument and verify its acknowledgement.
    ///
    /// Flushes first, gives the instrument a settle period after the send,
    /// then expects the config echo plus status byte. The configuration is
    /// stored only when the acknowledgement matches.
    pub async fn set_config(
        &mut self,
        config: InjectionConfig,
    ) -> Result<AckStatus, ResistEsError> {
        let frame = ConfigFrame::encode(&config)?;
        self.flush().await?;
        info!(frame = %frame, "sending configuration");
        self.send_with_retry(frame.as_bytes()).await?;
        tokio::time::sleep(CONFIG_SETTLE).await;
        let ack = self.collect_exact(ACK_FRAME_LEN, self.options.ack_timeout).await?;
        let status = verify_ack(&ack, &frame)?;
        info!(
            run = status.run(),
            board_id = status.board_id(),
            "configuration acknowledged"
        );
        self.config = Some(config);
        self.rx.clear();
        self.rx_checked = 0;
        Ok(status)
    }

    /// Ask for an immediate measurement outside the instrument's own cadence.
    pub async fn request_measure(&mut self) -> Result<(), ResistEsError> {
        debug!("requesting measurement");
        self.send_with_retry(&[REQUEST_MEASURE_CMD]).await
    }

    /// Read once from the link and append to the reception buffer.
    pub async fn poll(&mut self, timeout: Duration) -> Result<usize, ResistEsError> {
        let mut chunk = [0u8; 1024];
        let n = self.link.receive(&mut chunk, timeout).await?;
        if n > 0 {
            self.rx.extend_from_slice(&chunk[..n]);
            debug!(bytes = n, buffered = self.rx.len(), "measurement bytes");
        }
        Ok(n)
    }

    /// Extract the oldest complete frame from the buffer front, if present.
    ///
    /// An invalid candidate is logged and counted but stays buffered; only
    /// the buffer cap discards bytes, to keep a noisy line from growing the
    /// buffer without bound.
    pub fn try_take_raw(&mut self) -> Result<Option<RawMeasurement>, ResistEsError> {
        let config = self.config.ok_or(ResistEsError::NotConfigured)?;
        let required = required_frame_len(config.channel_count);
        if self.rx.len() < required || self.rx.len() == self.rx_checked {
            return Ok(None);
        }
        match RawMeasurement::parse(&self.rx[..required], config.channel_count) {
            Ok(raw) => {
                self.rx.advance(required);
                self.rx_checked = 0;
                debug!(count = raw.count, "frame extracted");
                Ok(Some(raw))
            }
            Err(e) => {
                self.rejected_frames += 1;
                self.rx_checked = self.rx.len();
                warn!(error = %e, buffered = self.rx.len(), "rejected measurement candidate");
                let cap = RX_BUFFER_FLOOR.max(4 * required);
                if self.rx.len() > cap {
                    self.dropped_bytes += self.rx.len() as u64;
                    warn!(bytes = self.rx.len(), "reception buffer over capacity, clearing");
                    self.rx.clear();
                    self.rx_checked = 0;
                }
                Ok(None)
            }
        }
    }

    /// Extract and convert the oldest complete frame.
    pub fn try_take_real(&mut self) -> Result<Option<RealMeasurement>, ResistEsError> {
        Ok(self.try_take_raw()?.map(|raw| RealMeasurement::from(&raw)))
    }

    /// Stream measurements into `sink` until a stop signal arrives or the
    /// control channel closes.
    ///
    /// Writes the header, then on every turn either reacts to a control
    /// signal or polls the link and drains complete frames in arrival order.
    pub async fn acquire<S: MeasurementSink>(
        &mut self,
        sink: &mut S,
        options: &AcquireOptions,
        signals: &mut mpsc::UnboundedReceiver<AcquireSignal>,
    ) -> Result<AcquireStats, ResistEsError> {
        let config = self.config.ok_or(ResistEsError::NotConfigured)?;
        let rejected_before = self.rejected_frames;
        let dropped_before = self.dropped_bytes;
        sink.write_header(&field_names(config.channel_count, options.timestamps))?;
        let mut frames_written = 0u64;
        info!(channels = config.channel_count, "acquisition started");
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(AcquireSignal::RequestMeasure) => self.request_measure().await?,
                    Some(AcquireSignal::Stop) | None => break,
                },
                result = self.poll(options.poll_timeout) => {
                    result?;
                    while let Some(real) = self.try_take_real()? {
                        debug!(%real, "measurement");
                        let timestamp = options.timestamps.then(Utc::now);
                        sink.write_row(&format_row(&real, timestamp))?;
                        frames_written += 1;
                    }
                }
            }
        }
        let stats = AcquireStats {
            frames_written,
            frames_rejected: self.rejected_frames - rejected_before,
            bytes_dropped: self.dropped_bytes - dropped_before,
        };
        info!(
            frames = stats.frames_written,
            rejected = stats.frames_rejected,
            "acquisition stopped"
        );
        Ok(stats)
    }

    /// Close the underlying link.
    pub async fn close(&mut self) -> Result<(), ResistEsError> {
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_i28, encode_u14};
    use crate::link::mock::MockLink;

    fn test_config() -> InjectionConfig {
        InjectionConfig {
            voltage: 16.55,
            frequency: 976.5625,
            impulse_count: 1,
            channel_count: 1,
            integration_count: 1,
        }
    }

    fn ack_for(config: &InjectionConfig, status: u8) -> Vec<u8> {
        let frame = ConfigFrame::encode(config).unwrap();
        let mut ack = frame.as_bytes().to_vec();
        ack.push(status);
        ack
    }

    fn measure_frame(count: u16, channels: &[(i32, i32)]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&encode_u14(count));
        frame.extend_from_slice(&encode_u14(1000));
        frame.extend_from_slice(&encode_u14(2000));
        frame.extend_from_slice(&encode_i28(5000));
        frame.extend_from_slice(&encode_i28(-100));
        for &(p, q) in channels {
            frame.extend_from_slice(&encode_i28(p));
            frame.extend_from_slice(&encode_i28(q));
        }
        frame
    }

    struct RecordingSink {
        headers: Vec<Vec<String>>,
        rows: Vec<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                headers: Vec::new(),
                rows: Vec::new(),
            }
        }
    }

    impl MeasurementSink for RecordingSink {
        fn write_header(&mut self, fields: &[String]) -> Result<(), ResistEsError> {
            self.headers.push(fields.to_vec());
            Ok(())
        }

        fn write_row(&mut self, values: &[String]) -> Result<(), ResistEsError> {
            self.rows.push(values.to_vec());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_config_round_trip() {
        let (link, state) = MockLink::new();
        let mut device = ResistEs::new(Box::new(link));
        let config = test_config();
        state
            .lock()
            .unwrap()
            .responses
            .push_back(ack_for(&config, 0x05));

        let status = device.set_config(config).await.unwrap();
        assert!(status.run());
        assert_eq!(status.board_id(), 2);
        assert_eq!(device.config(), Some(config));

        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ConfigFrame::encode(&config).unwrap().as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn set_config_rejects_corrupted_ack() {
        let (link, state) = MockLink::new();
        let mut device = ResistEs::new(Box::new(link));
        let config = test_config();
        let mut ack = ack_for(&config, 0x05);
        ack[3] ^= 0x40;
        state.lock().unwrap().responses.push_back(ack);

        let err = device.set_config(config).await.unwrap_err();
        assert!(matches!(err, ResistEsError::AckMismatch { .. }));
        assert_eq!(device.config(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_config_flushes_stale_bytes_first() {
        let (link, state) = MockLink::new();
        let mut device = ResistEs::new(Box::new(link));
        let config = test_config();
        {
            let mut state = state.lock().unwrap();
            state.reads.push_back(vec![0xAA; 17]);
            state.reads.push_back(vec![0xBB; 3]);
            state.responses.push_back(ack_for(&config, 0x01));
        }

        let status = device.set_config(config).await.unwrap();
        assert!(status.run());
        assert_eq!(device.buffered_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_gives_up_on_endless_stream() {
        let (link, state) = MockLink::new();
        state.lock().unwrap().noise = Some(vec![0x55; 32]);
        let mut device = ResistEs::with_options(
            Box::new(link),
            SessionOptions {
                ack_timeout: Duration::from_secs(1),
                flush_timeout: Duration::from_millis(200),
            },
        );

        let err = device.flush().await.unwrap_err();
        assert!(matches!(err, ResistEsError::FlushTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_retries_transient_failures() {
        let (link, state) = MockLink::new();
        state.lock().unwrap().fail_sends = 2;
        let mut device = ResistEs::new(Box::new(link));

        device.request_measure().await.unwrap();
        let sent = state.lock().unwrap().sent.clone();
        assert_eq!(sent, vec![vec![REQUEST_MEASURE_CMD]]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_gives_up_after_bounded_attempts() {
        let (link, state) = MockLink::new();
        state.lock().unwrap().fail_sends = 3;
        let mut device = ResistEs::new(Box::new(link));

        assert!(device.request_measure().await.is_err());
        assert!(state.lock().unwrap().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_decode_requires_configuration() {
        let (link, _state) = MockLink::new();
        let mut device = ResistEs::new(Box::new(link));
        assert!(matches!(
            device.try_take_raw(),
            Err(ResistEsError::NotConfigured)
        ));
    }

    async fn configured_device(
        channels: u8,
    ) -> (ResistEs, std::sync::Arc<std::sync::Mutex<crate::link::mock::MockState>>) {
        let (link, state) = MockLink::new();
        let mut device = ResistEs::new(Box::new(link));
        let mut config = test_config();
        config.channel_count = channels;
        state
            .lock()
            .unwrap()
            .responses
            .push_back(ack_for(&config, 0x05));
        device.set_config(config).await.unwrap();
        (device, state)
    }

    #[tokio::test(start_paused = true)]
    async fn drains_frames_in_arrival_order() {
        let (mut device, state) = configured_device(1).await;
        let mut burst = measure_frame(1, &[(10, 20)]);
        burst.extend_from_slice(&measure_frame(2, &[(30, 40)]));
        state.lock().unwrap().reads.push_back(burst);

        device.poll(Duration::from_millis(100)).await.unwrap();
        let first = device.try_take_real().unwrap().unwrap();
        let second = device.try_take_real().unwrap().unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(device.try_take_real().unwrap().is_none());
        assert_eq!(device.buffered_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_waits_for_the_rest() {
        let (mut device, state) = configured_device(1).await;
        let frame = measure_frame(9, &[(1, 2)]);
        {
            let mut state = state.lock().unwrap();
            state.reads.push_back(frame[..10].to_vec());
            state.reads.push_back(frame[10..].to_vec());
        }

        device.poll(Duration::from_millis(100)).await.unwrap();
        assert!(device.try_take_real().unwrap().is_none());
        device.poll(Duration::from_millis(100)).await.unwrap();
        let real = device.try_take_real().unwrap().unwrap();
        assert_eq!(real.count, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn noisy_buffer_is_capped() {
        let (mut device, state) = configured_device(1).await;
        // tag of the very first byte is wrong, the candidate can never validate
        for _ in 0..20 {
            state.lock().unwrap().reads.push_back(vec![0x00; 64]);
        }

        for _ in 0..20 {
            device.poll(Duration::from_millis(100)).await.unwrap();
            let _ = device.try_take_raw().unwrap();
        }

        assert!(device.dropped_bytes() > 0);
        assert!(device.rejected_frames() > 0);
        assert!(device.buffered_bytes() < 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_writes_header_and_rows_until_stopped() {
        let (mut device, state) = configured_device(2).await;
        let mut burst = measure_frame(1, &[(10, 20), (30, 40)]);
        burst.extend_from_slice(&measure_frame(2, &[(50, 60), (70, 80)]));
        state.lock().unwrap().reads.push_back(burst);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(AcquireSignal::RequestMeasure).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(AcquireSignal::Stop).unwrap();
        });

        let mut sink = RecordingSink::new();
        let stats = device
            .acquire(&mut sink, &AcquireOptions::default(), &mut rx)
            .await
            .unwrap();

        assert_eq!(stats.frames_written, 2);
        assert_eq!(stats.frames_rejected, 0);
        assert_eq!(sink.headers.len(), 1);
        assert_eq!(sink.headers[0].len(), 5 + 2 * 4);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.rows[0][0], "1");
        assert_eq!(sink.rows[1][0], "2");

        // the manual measurement request went out while the loop ran
        let sent = state.lock().unwrap().sent.clone();
        assert!(sent.iter().any(|s| s == &[REQUEST_MEASURE_CMD]));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_stops_when_control_channel_closes() {
        let (mut device, _state) = configured_device(1).await;
        let (tx, mut rx) = mpsc::unbounded_channel::<AcquireSignal>();
        drop(tx);

        let mut sink = RecordingSink::new();
        let stats = device
            .acquire(&mut sink, &AcquireOptions::default(), &mut rx)
            .await
            .unwrap();
        assert_eq!(stats.frames_written, 0);
        assert_eq!(sink.headers.len(), 1);
    }
}
