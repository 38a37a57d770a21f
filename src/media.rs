//! Media primitives shared by capture, the real-time connection and playback.
//!
//! A [`MediaStream`] is a cheap, cloneable handle. Clones share the same
//! tracks, so stopping a track through any clone stops it everywhere. Audio
//! flows through a take-once receiver: whichever consumer takes it (the
//! connection for a local stream, the playback sink for a remote one) owns the
//! chunk flow.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A chunk of mono f32 audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in \[-1, 1\].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the chunk was captured or received.
    pub captured_at: Instant,
}

/// Kind of media carried by a track. Only audio is produced today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
}

/// A single stoppable media track.
///
/// Producers (capture threads, socket readers) watch [`MediaTrack::stopped`]
/// and release their device or stop forwarding when it fires.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    stop: CancellationToken,
}

impl MediaTrack {
    /// Create a live audio track.
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
            stop: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_live(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Token cancelled when the track is stopped.
    pub fn stopped(&self) -> CancellationToken {
        self.stop.clone()
    }
}

struct StreamInner {
    id: String,
    tracks: Vec<MediaTrack>,
    audio: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
}

/// A set of tracks plus the audio chunk flow they produce.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks)
            .finish()
    }
}

impl MediaStream {
    /// Build a stream from its tracks and the receiver that yields its audio.
    pub fn new(
        id: impl Into<String>,
        tracks: Vec<MediaTrack>,
        audio: mpsc::Receiver<AudioChunk>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks,
                audio: Mutex::new(Some(audio)),
            }),
        }
    }

    /// Build a single-track audio stream and return the sender feeding it.
    pub fn audio_channel(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Sender<AudioChunk>) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let track = MediaTrack::audio(format!("{id}-audio"));
        (Self::new(id, vec![track], rx), tx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    /// Take the audio receiver. Returns `None` once it has been taken.
    pub fn take_audio(&self) -> Option<mpsc::Receiver<AudioChunk>> {
        match self.inner.audio.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Stop every track in the stream.
    pub fn stop_all(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
    }

    /// True while at least one track is live.
    pub fn is_active(&self) -> bool {
        self.inner.tracks.iter().any(MediaTrack::is_live)
    }

    /// Token that fires when the first track of the stream stops.
    ///
    /// Streams without tracks yield an already-cancelled token.
    pub fn stopped(&self) -> CancellationToken {
        match self.inner.tracks.first() {
            Some(track) => track.stopped(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// True if both handles refer to the same stream.
    pub fn same_as(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
