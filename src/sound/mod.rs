//! Alarm sound control.
//!
//! Two playback strategies: a looping decoded audio asset, and a synthesized
//! tone loop used when the asset is missing or fails to decode. Playback
//! failures never surface to the operator — a machine with no audio device
//! simply runs silent. Preferences (mute, volume, tone family) persist
//! through the preference store.
//!
//! The rodio output stream is not `Send`, so a dedicated player thread owns
//! it and the controller talks to it over a command channel.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rodio::source::SineWave;
use rodio::{Decoder, OutputStream, Sink, Source};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prefs::PrefsStore;

/// Preference-store key for [`SoundPrefs`].
const SOUND_PREFS_KEY: &str = "sound";

/// Relative amplitude of the synthesized fallback tone.
const SYNTH_AMPLITUDE: f32 = 0.25;

/// Alarm tone family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTone {
    Classic,
    Pulse,
    Chime,
}

impl Default for AlarmTone {
    fn default() -> Self {
        Self::Classic
    }
}

impl AlarmTone {
    /// Frequency of the synthesized fallback tone.
    pub fn frequency(&self) -> f32 {
        match self {
            Self::Classic => 880.0,
            Self::Pulse => 660.0,
            Self::Chime => 520.0,
        }
    }

    /// File name of the decoded-asset strategy for this tone.
    pub fn asset_name(&self) -> &'static str {
        match self {
            Self::Classic => "alarm_classic.wav",
            Self::Pulse => "alarm_pulse.wav",
            Self::Chime => "alarm_chime.wav",
        }
    }
}

impl std::fmt::Display for AlarmTone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Pulse => write!(f, "pulse"),
            Self::Chime => write!(f, "chime"),
        }
    }
}

/// Persisted audio preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundPrefs {
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub tone: AlarmTone,
}

fn default_volume() -> f32 {
    0.8
}

impl Default for SoundPrefs {
    fn default() -> Self {
        Self {
            muted: false,
            volume: default_volume(),
            tone: AlarmTone::default(),
        }
    }
}

enum PlayerCmd {
    Play {
        tone: AlarmTone,
        volume: f32,
        asset: Option<PathBuf>,
    },
    SetVolume(f32),
    Stop,
    Shutdown,
}

struct PlayerHandle {
    tx: mpsc::Sender<PlayerCmd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PlayerHandle {
    fn send(&self, cmd: PlayerCmd) {
        // A dead player thread means audio is unavailable; stay silent.
        let _ = self.tx.send(cmd);
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(PlayerCmd::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_player() -> PlayerHandle {
    let (tx, rx) = mpsc::channel::<PlayerCmd>();
    let thread = thread::Builder::new()
        .name("watchdesk-audio".to_string())
        .spawn(move || player_thread(rx))
        .ok();
    PlayerHandle { tx, thread }
}

fn player_thread(rx: mpsc::Receiver<PlayerCmd>) {
    // The output stream must outlive every sink appended to it.
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(error) => {
            debug!(target: "sound", %error, "audio output unavailable, alarms will be silent");
            // Keep draining so senders never block or error.
            while let Ok(cmd) = rx.recv() {
                if matches!(cmd, PlayerCmd::Shutdown) {
                    return;
                }
            }
            return;
        }
    };

    let mut sink: Option<Sink> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            PlayerCmd::Play {
                tone,
                volume,
                asset,
            } => {
                if let Some(old) = sink.take() {
                    old.stop();
                }
                let new_sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(error) => {
                        debug!(target: "sound", %error, "failed to open audio sink");
                        continue;
                    }
                };
                new_sink.set_volume(volume);

                if !append_decoded_asset(&new_sink, asset.as_deref()) {
                    // Synthesized fallback; the sine source is endless.
                    new_sink.append(SineWave::new(tone.frequency()).amplify(SYNTH_AMPLITUDE));
                }
                sink = Some(new_sink);
            }
            PlayerCmd::SetVolume(volume) => {
                if let Some(active) = &sink {
                    active.set_volume(volume);
                }
            }
            PlayerCmd::Stop => {
                if let Some(active) = sink.take() {
                    active.stop();
                }
            }
            PlayerCmd::Shutdown => break,
        }
    }
}

/// Try the decoded-asset strategy; false means fall back to the synthesized
/// tone. Failure here is expected (missing file, bad codec) and only logged.
fn append_decoded_asset(sink: &Sink, asset: Option<&std::path::Path>) -> bool {
    let Some(path) = asset else {
        return false;
    };
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) => {
            debug!(target: "sound", path = %path.display(), %error, "alarm asset unavailable");
            return false;
        }
    };
    match Decoder::new(BufReader::new(file)) {
        Ok(source) => {
            sink.append(source.repeat_infinite());
            true
        }
        Err(error) => {
            debug!(target: "sound", path = %path.display(), %error, "alarm asset failed to decode");
            false
        }
    }
}

/// Alarm sound controller with persisted preferences.
pub struct SoundController {
    prefs: Mutex<SoundPrefs>,
    store: Arc<PrefsStore>,
    player: Mutex<Option<PlayerHandle>>,
    asset_dir: Option<PathBuf>,
    playing: AtomicBool,
}

impl SoundController {
    pub fn new(store: Arc<PrefsStore>, asset_dir: Option<PathBuf>) -> Self {
        let prefs = store.get::<SoundPrefs>(SOUND_PREFS_KEY).unwrap_or_default();
        Self {
            prefs: Mutex::new(prefs),
            store,
            player: Mutex::new(None),
            asset_dir,
            playing: AtomicBool::new(false),
        }
    }

    pub fn prefs(&self) -> SoundPrefs {
        self.prefs.lock().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Start the looping alarm. A no-op while muted.
    pub fn start_alarm(&self) {
        let prefs = self.prefs();
        if prefs.muted {
            debug!(target: "sound", "alarm muted, not playing");
            return;
        }
        let asset = self
            .asset_dir
            .as_ref()
            .map(|dir| dir.join(prefs.tone.asset_name()));
        self.with_player(|player| {
            player.send(PlayerCmd::Play {
                tone: prefs.tone,
                volume: prefs.volume,
                asset,
            });
        });
        self.playing.store(true, Ordering::Relaxed);
    }

    /// Stop playback. Idempotent and safe when nothing is playing.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Relaxed);
        let player = self.player.lock();
        if let Some(player) = player.as_ref() {
            player.send(PlayerCmd::Stop);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        {
            let mut prefs = self.prefs.lock();
            prefs.muted = muted;
        }
        self.persist();
        if muted {
            self.stop();
        }
    }

    /// Set the volume, clamped to 0..=1.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        {
            let mut prefs = self.prefs.lock();
            prefs.volume = volume;
        }
        self.persist();
        if self.is_playing() {
            let player = self.player.lock();
            if let Some(player) = player.as_ref() {
                player.send(PlayerCmd::SetVolume(volume));
            }
        }
    }

    pub fn set_tone(&self, tone: AlarmTone) {
        {
            let mut prefs = self.prefs.lock();
            prefs.tone = tone;
        }
        self.persist();
        // Restart playback so the new tone takes effect immediately.
        if self.is_playing() {
            self.start_alarm();
        }
    }

    fn with_player(&self, f: impl FnOnce(&PlayerHandle)) {
        let mut player = self.player.lock();
        let handle = player.get_or_insert_with(spawn_player);
        f(handle);
    }

    fn persist(&self) {
        let prefs = self.prefs();
        if let Err(error) = self.store.set(SOUND_PREFS_KEY, &prefs) {
            warn!(target: "sound", %error, "failed to persist sound preferences");
        }
    }
}
