//! Remote audio playback.
//!
//! [`PlaybackSink`] is the single reusable output surface remote audio is
//! routed to. It is created once, identified by a fixed id, and only ever
//! re-pointed at a new source or detached; it is never destroyed between
//! sessions. Rendering is delegated to an [`AudioOutput`] backend
//! ([`CpalOutput`] for real speakers).

use crate::audio::capture::resample;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::media::{AudioChunk, MediaStream};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Output backend the sink renders into.
pub trait AudioOutput: Send + Sync {
    /// Open or resume the output device.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Playback`] when the device refuses to start.
    fn start(&self) -> Result<()>;

    /// Queue a chunk for rendering.
    fn write(&self, chunk: &AudioChunk);

    /// Stop rendering and discard anything queued.
    fn stop(&self);
}

struct Forwarder {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SinkState {
    source: Option<MediaStream>,
    /// Receiver handed back by a paused forwarder so playback can resume.
    parked: Option<mpsc::Receiver<AudioChunk>>,
    forwarder: Option<Forwarder>,
    next_forwarder_id: u64,
}

/// The shared playback sink.
pub struct PlaybackSink {
    id: String,
    output: Arc<dyn AudioOutput>,
    muted: Arc<AtomicBool>,
    state: Arc<Mutex<SinkState>>,
}

impl PlaybackSink {
    /// Create a sink rendering into `output`. Starts muted with no source.
    pub fn new(id: impl Into<String>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            id: id.into(),
            output,
            muted: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    /// Point the sink at a new source. Any running forwarder is stopped.
    pub fn attach(&self, stream: MediaStream) {
        let mut state = self.lock();
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.cancel.cancel();
        }
        state.parked = None;
        debug!(sink = %self.id, source = %stream.id(), "playback source attached");
        state.source = Some(stream);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Id of the stream currently attached, if any.
    pub fn source_id(&self) -> Option<String> {
        self.lock().source.as_ref().map(|s| s.id().to_owned())
    }

    pub fn is_playing(&self) -> bool {
        self.lock().forwarder.is_some()
    }

    /// Begin forwarding the attached source into the output.
    ///
    /// Must be called from within a tokio runtime. Calling it while already
    /// playing is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Playback`] when there is no source, the source's
    /// audio has already been consumed elsewhere, or the output refuses to
    /// start.
    pub fn play(&self) -> Result<()> {
        let mut state = self.lock();
        if state.forwarder.is_some() {
            return Ok(());
        }
        let source = state
            .source
            .clone()
            .ok_or_else(|| VoiceError::Playback("no source attached".into()))?;
        let rx = match state.parked.take() {
            Some(rx) => rx,
            None => source
                .take_audio()
                .ok_or_else(|| VoiceError::Playback("source audio already consumed".into()))?,
        };

        if let Err(e) = self.output.start() {
            state.parked = Some(rx);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let forwarder_id = state.next_forwarder_id;
        state.next_forwarder_id += 1;
        state.forwarder = Some(Forwarder {
            id: forwarder_id,
            cancel: cancel.clone(),
        });
        drop(state);

        tokio::spawn(forward(
            rx,
            source,
            Arc::clone(&self.output),
            Arc::clone(&self.muted),
            Arc::clone(&self.state),
            forwarder_id,
            cancel,
        ));
        info!(sink = %self.id, "playback started");
        Ok(())
    }

    /// Stop forwarding. The source stays attached and can be resumed.
    pub fn pause(&self) {
        let mut state = self.lock();
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.cancel.cancel();
        }
        drop(state);
        self.output.stop();
    }

    /// Pause, mute and clear the source.
    ///
    /// When `expected` names a stream and the sink currently carries a
    /// different one, the sink belongs to a newer session and is left alone;
    /// returns `false` in that case.
    pub fn detach(&self, expected: Option<&MediaStream>) -> bool {
        {
            let state = self.lock();
            if let (Some(expected), Some(current)) = (expected, state.source.as_ref())
                && !current.same_as(expected)
            {
                debug!(sink = %self.id, "sink carries a newer source; not detaching");
                return false;
            }
        }
        self.pause();
        self.set_muted(true);
        let mut state = self.lock();
        state.source = None;
        state.parked = None;
        true
    }
}

/// Pull chunks from the remote stream into the output until cancelled or the
/// stream ends.
async fn forward(
    mut rx: mpsc::Receiver<AudioChunk>,
    source: MediaStream,
    output: Arc<dyn AudioOutput>,
    muted: Arc<AtomicBool>,
    state: Arc<Mutex<SinkState>>,
    forwarder_id: u64,
    cancel: CancellationToken,
) {
    let source_stopped = source.stopped();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Paused: hand the receiver back if the source is unchanged.
                let mut st = match state.lock() {
                    Ok(s) => s,
                    Err(p) => p.into_inner(),
                };
                if st.source.as_ref().is_some_and(|s| s.same_as(&source)) {
                    st.parked = Some(rx);
                }
                return;
            }
            _ = source_stopped.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if !muted.load(Ordering::SeqCst) {
                        output.write(&chunk);
                    }
                }
                None => break,
            },
        }
    }

    let mut st = match state.lock() {
        Ok(s) => s,
        Err(p) => p.into_inner(),
    };
    if st.forwarder.as_ref().is_some_and(|f| f.id == forwarder_id) {
        st.forwarder = None;
    }
    debug!(source = %source.id(), "playback forwarder finished");
}

// ---------------------------------------------------------------------------
// cpal output
// ---------------------------------------------------------------------------

/// How long `start()` waits for the output thread to open the device.
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on queued samples (10 s at the output rate).
const MAX_QUEUED_SECONDS: usize = 10;

/// Speaker output via cpal.
///
/// The device is opened on a dedicated thread on first `start()` and released
/// on `stop()`. Samples are pulled from a shared queue by the device callback.
pub struct CpalOutput {
    config: AudioConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
    running: Mutex<Option<CancellationToken>>,
}

impl CpalOutput {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running: Mutex::new(None),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::Playback(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn running(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        match self.running.lock() {
            Ok(r) => r,
            Err(p) => p.into_inner(),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn start(&self) -> Result<()> {
        let mut running = self.running();
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return Ok(());
        }

        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let config = self.config.clone();
        let queue = Arc::clone(&self.queue);
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("sink-output".to_owned())
            .spawn(move || run_output(&config, queue, thread_stop, ready_tx))
            .map_err(|e| VoiceError::Playback(format!("failed to spawn output thread: {e}")))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                *running = Some(stop);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                stop.cancel();
                Err(VoiceError::Playback("output device did not open in time".into()))
            }
        }
    }

    fn write(&self, chunk: &AudioChunk) {
        let samples = resample(&chunk.samples, chunk.sample_rate, self.config.output_sample_rate);
        let cap = self.config.output_sample_rate as usize * MAX_QUEUED_SECONDS;
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(p) => p.into_inner(),
        };
        queue.extend(samples);
        let overflow = queue.len().saturating_sub(cap);
        if overflow > 0 {
            queue.drain(..overflow);
            debug!(dropped = overflow, "output queue full, dropped oldest samples");
        }
    }

    fn stop(&self) {
        if let Some(stop) = self.running().take() {
            stop.cancel();
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

fn run_output(
    config: &AudioConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: CancellationToken,
    ready: std::sync::mpsc::SyncSender<Result<()>>,
) {
    let stream = match open_output(config, queue) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    while !stop.is_cancelled() {
        std::thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
    info!("audio output stopped");
}

fn open_output(config: &AudioConfig, queue: Arc<Mutex<VecDeque<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| VoiceError::Playback(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::Playback(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::Playback("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut queue = match queue.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    *sample = queue.pop_front().unwrap_or(0.0);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Playback(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::Playback(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}
