//! The speech engine: cache-first synthesis through an external TTS binary,
//! playback via the subprocess supervisor, and the circuit breaker that keeps
//! a broken synthesis path from silently stalling the operator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use earshot_core::config::EarshotConfig;
use earshot_proc::Supervisor;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::breaker::{ApiHealth, CircuitBreaker};
use crate::cache::AudioCache;
use crate::chime;
use crate::{Result, TtsError};

/// Per-call overrides (sessions may pin a voice/emotion).
#[derive(Debug, Clone, Default)]
pub struct SpeakOptions {
    pub voice: Option<String>,
    pub emotion: Option<String>,
}

/// Snapshot of the settings that shape one synthesis call.
#[derive(Debug, Clone)]
struct RenderSettings {
    binary: Vec<String>,
    player: Vec<String>,
    model: String,
    voice: String,
    emotion: String,
    speed: f64,
    timeout: Duration,
}

struct PregenJob {
    texts: Vec<String>,
    gen: u64,
    opts: SpeakOptions,
}

type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct TtsEngine {
    config: Arc<RwLock<EarshotConfig>>,
    supervisor: Arc<Supervisor>,
    cache: AudioCache,
    breaker: Arc<CircuitBreaker>,
    pregen_gen: AtomicU64,
    pregen_tx: mpsc::UnboundedSender<PregenJob>,
    error_cb: Mutex<Option<ErrorCallback>>,
}

impl TtsEngine {
    pub fn new(config: Arc<RwLock<EarshotConfig>>, supervisor: Arc<Supervisor>) -> Arc<Self> {
        Self::with_breaker(config, supervisor, Arc::new(CircuitBreaker::with_defaults()))
    }

    /// Construct with an injected breaker (tests shorten the cooldown).
    pub fn with_breaker(
        config: Arc<RwLock<EarshotConfig>>,
        supervisor: Arc<Supervisor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Arc<Self> {
        let cache_dir = config.read().unwrap().tts.cache_dir.clone();
        let (pregen_tx, pregen_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            config,
            supervisor,
            cache: AudioCache::new(cache_dir),
            breaker,
            pregen_gen: AtomicU64::new(0),
            pregen_tx,
            error_cb: Mutex::new(None),
        });

        tokio::spawn(pregen_worker(Arc::downgrade(&engine), pregen_rx));
        engine
    }

    /// Register the callback invoked whenever speech is suppressed.
    pub fn set_error_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.error_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn api_health(&self) -> ApiHealth {
        self.breaker.health()
    }

    pub fn reset_failure_counters(&self) {
        self.breaker.reset();
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Kill all in-flight playback and synthesis subprocesses.
    pub fn stop(&self) {
        self.supervisor.cancel_tagged("playback");
        self.supervisor.cancel_tagged("tts");
    }

    /// Speak and block until playback finishes.
    pub async fn speak(self: &Arc<Self>, text: &str, opts: &SpeakOptions) -> Result<()> {
        match self.generate_to_file(text, opts).await {
            Some(path) => self.play_wav(&path).await,
            None => Ok(()),
        }
    }

    /// Fire-and-forget speech.
    pub fn speak_async(self: &Arc<Self>, text: &str, opts: &SpeakOptions) {
        let engine = Arc::clone(self);
        let text = text.to_string();
        let opts = opts.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.speak(&text, &opts).await {
                warn!("async speech failed: {e}");
            }
        });
    }

    /// Cached audio plays regardless of breaker state; uncached audio goes
    /// through the API path when the circuit is closed, otherwise the
    /// operator gets the suppression notification instead of silence.
    pub async fn speak_with_local_fallback(self: &Arc<Self>, text: &str, opts: &SpeakOptions) {
        let settings = self.render_settings(opts);
        let key = AudioCache::key(
            text,
            &settings.voice,
            &settings.emotion,
            &settings.model,
            settings.speed,
        );
        if let Some(path) = self.cache.get(&key) {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let _ = engine.play_wav(&path).await;
            });
            return;
        }
        if self.breaker.is_closed() {
            self.speak_async(text, opts);
        } else {
            self.maybe_spawn_probe();
            self.notify_suppressed();
        }
    }

    /// Queue background pregeneration for `texts`, obsoleting earlier queues.
    pub fn pregenerate(self: &Arc<Self>, texts: Vec<String>, opts: &SpeakOptions) {
        let gen = self.pregen_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.pregen_tx.send(PregenJob {
            texts,
            gen,
            opts: opts.clone(),
        });
    }

    /// Generate the first `count` uncached texts synchronously (each step
    /// re-checks the generation counter and stops if a later call obsoleted
    /// this one), then queue the remainder for the background worker.
    pub async fn pregenerate_priority(
        self: &Arc<Self>,
        texts: Vec<String>,
        count: usize,
        opts: &SpeakOptions,
    ) {
        let gen = self.pregen_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = self.render_settings(opts);

        let mut generated = 0usize;
        let mut remainder: Vec<String> = Vec::new();
        for text in texts {
            let key = AudioCache::key(
                &text,
                &settings.voice,
                &settings.emotion,
                &settings.model,
                settings.speed,
            );
            if self.cache.contains(&key) {
                continue;
            }
            if generated < count {
                if self.pregen_gen.load(Ordering::SeqCst) != gen {
                    debug!("priority pregeneration obsoleted mid-call");
                    return;
                }
                self.generate_to_file(&text, opts).await;
                generated += 1;
            } else {
                remainder.push(text);
            }
        }

        if !remainder.is_empty() {
            let _ = self.pregen_tx.send(PregenJob {
                texts: remainder,
                gen,
                opts: opts.clone(),
            });
        }
    }

    /// Play a named chime sequence. Unknown names are silent no-ops.
    pub fn play_chime(self: &Arc<Self>, style: &str) {
        let Some(steps) = chime::chime_steps(style) else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            for (freq, dur_ms, gap_ms) in steps {
                if let Err(e) = engine.play_tone(*freq, *dur_ms).await {
                    debug!("chime tone failed: {e}");
                    return;
                }
                if *gap_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(*gap_ms)).await;
                }
            }
        });
    }

    /// Synthesise and play a single tone, blocking until playback ends.
    pub async fn play_tone(&self, freq_hz: f32, dur_ms: u64) -> Result<()> {
        let bytes = chime::tone_wav_bytes(freq_hz, dur_ms);
        let tmp = tempfile::Builder::new()
            .prefix("earshot-tone-")
            .suffix(".wav")
            .tempfile()
            .map_err(TtsError::Io)?;
        std::fs::write(tmp.path(), &bytes).map_err(TtsError::Io)?;
        self.play_wav(tmp.path()).await
    }

    /// Cache-first synthesis. Returns the WAV path, or `None` when the
    /// circuit is open or generation failed (failure already recorded).
    pub async fn generate_to_file(self: &Arc<Self>, text: &str, opts: &SpeakOptions) -> Option<PathBuf> {
        let settings = self.render_settings(opts);
        let key = AudioCache::key(
            text,
            &settings.voice,
            &settings.emotion,
            &settings.model,
            settings.speed,
        );
        if let Some(path) = self.cache.get(&key) {
            return Some(path);
        }

        if !self.breaker.is_closed() {
            self.maybe_spawn_probe();
            self.notify_suppressed();
            return None;
        }

        let out_path = self.cache.path_for(&key);
        match self.generate_raw(text, &settings, &out_path).await {
            Ok(()) => {
                self.breaker.record_success();
                self.cache.insert(&key, out_path.clone());
                Some(out_path)
            }
            Err(reason) => {
                warn!(%reason, "tts generation failed");
                self.breaker.record_failure(Some(&reason));
                None
            }
        }
    }

    // --- internals ---------------------------------------------------------

    fn render_settings(&self, opts: &SpeakOptions) -> RenderSettings {
        let config = self.config.read().unwrap();
        RenderSettings {
            binary: config.tts.binary.clone(),
            player: config.tts.player.clone(),
            model: config.tts.model.clone(),
            voice: opts.voice.clone().unwrap_or_else(|| config.tts.voice.clone()),
            emotion: opts
                .emotion
                .clone()
                .unwrap_or_else(|| config.tts.emotion.clone()),
            speed: config.tts.speed,
            timeout: Duration::from_secs(config.tts.generate_timeout_secs.max(1)),
        }
    }

    /// Run the synthesis binary and stream its stdout into `out_path`.
    /// Returns the failure reason string recorded by the breaker.
    async fn generate_raw(
        &self,
        text: &str,
        settings: &RenderSettings,
        out_path: &Path,
    ) -> std::result::Result<(), String> {
        let program = settings
            .binary
            .first()
            .ok_or_else(|| "tts binary not found".to_string())?;
        if which::which(program).is_err() {
            return Err("tts binary not found".to_string());
        }

        let mut cmd = Command::new(program);
        let mut saw_text_placeholder = false;
        for arg in settings.binary.iter().skip(1) {
            if arg.contains("{text}") {
                saw_text_placeholder = true;
            }
            cmd.arg(substitute(arg, text, settings));
        }
        if !saw_text_placeholder {
            cmd.arg(text);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());

        let child = self
            .supervisor
            .start(cmd, "tts")
            .map_err(|e| format!("exception: {e}"))?;

        let collect = async {
            let mut wav = Vec::new();
            if let Some(mut stdout) = child.take_stdout().await {
                let _ = stdout.read_to_end(&mut wav).await;
            }
            let mut stderr_buf = Vec::new();
            if let Some(mut stderr) = child.take_stderr().await {
                let _ = stderr.read_to_end(&mut stderr_buf).await;
            }
            let status = child.wait().await;
            (wav, stderr_buf, status)
        };

        let (wav, stderr_buf, status) = match tokio::time::timeout(settings.timeout, collect).await
        {
            Ok(result) => result,
            Err(_) => {
                child.kill();
                return Err("timeout".to_string());
            }
        };

        let status = status.ok_or_else(|| "exception: child reaped elsewhere".to_string())?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let stderr_text = String::from_utf8_lossy(&stderr_buf);
            let excerpt: String = stderr_text.trim().chars().take(200).collect();
            return Err(format!("exit code {code}: {excerpt}"));
        }

        if wav.len() < 44 {
            return Err(format!("invalid WAV ({} bytes)", wav.len()));
        }

        let parent = out_path.parent().unwrap_or(Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".earshot-gen-")
            .tempfile_in(parent)
            .map_err(|e| format!("exception: {e}"))?;
        std::fs::write(tmp.path(), &wav).map_err(|e| format!("exception: {e}"))?;
        tmp.persist(out_path).map_err(|e| format!("exception: {e}"))?;
        Ok(())
    }

    async fn play_wav(&self, path: &Path) -> Result<()> {
        let player = {
            let config = self.config.read().unwrap();
            config.tts.player.clone()
        };
        let program = player
            .first()
            .ok_or_else(|| TtsError::Playback("no player configured".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(player.iter().skip(1));
        cmd.arg(path);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let child = self
            .supervisor
            .start(cmd, "playback")
            .map_err(|e| TtsError::Playback(e.to_string()))?;

        match child.wait().await {
            Some(status) if status.success() => Ok(()),
            // Signal-terminated means stop() cancelled us; partially played
            // audio is simply discarded.
            Some(status) if status.code().is_none() => Ok(()),
            Some(status) => Err(TtsError::Playback(format!(
                "player exited with {}",
                status.code().unwrap_or(-1)
            ))),
            None => Ok(()),
        }
    }

    fn maybe_spawn_probe(self: &Arc<Self>) {
        let Some(guard) = self.breaker.try_begin_probe() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // Held for the probe's lifetime; drop re-arms probing.
            let _guard = guard;
            let scratch = std::env::temp_dir().join(format!(
                "earshot-probe-{}.wav",
                uuid::Uuid::new_v4()
            ));
            let settings = engine.render_settings(&SpeakOptions::default());
            let outcome = engine.generate_raw("ok", &settings, &scratch).await;
            let _ = std::fs::remove_file(&scratch);

            match outcome {
                Ok(()) => {
                    debug!("tts recovery probe succeeded");
                    engine.breaker.record_success();
                    engine.notify_recovered();
                }
                Err(reason) => {
                    let mapped = if reason == "timeout" {
                        "probe timed out".to_string()
                    } else if reason.starts_with("exception") {
                        format!("probe {reason}")
                    } else {
                        format!("probe failed: {reason}")
                    };
                    debug!(%mapped, "tts recovery probe failed");
                    engine.breaker.probe_failed(&mapped);
                }
            }
        });
    }

    /// Operator-facing suppression: the callback fires on every suppressed
    /// call; the error chime is throttled to one per ten seconds.
    pub fn notify_suppressed(self: &Arc<Self>) {
        if let Some(cb) = self.error_cb.lock().unwrap().as_ref() {
            cb("TTS unavailable");
        }
        if self.breaker.should_play_suppression_chime() {
            self.play_chime("error");
        }
    }

    fn notify_recovered(self: &Arc<Self>) {
        self.breaker.reset_suppression_chime_timer();
        self.play_chime("success");
        self.speak_async("Speech restored", &SpeakOptions::default());
    }
}

fn substitute(arg: &str, text: &str, settings: &RenderSettings) -> String {
    arg.replace("{text}", text)
        .replace("{voice}", &settings.voice)
        .replace("{model}", &settings.model)
        .replace("{emotion}", &settings.emotion)
        .replace("{speed}", &format!("{:.2}", settings.speed))
}

/// Background pregeneration worker. Jobs from older generations are skipped
/// per-text, so a newer `pregenerate` call cheaply obsoletes queued work.
async fn pregen_worker(engine: Weak<TtsEngine>, mut rx: mpsc::UnboundedReceiver<PregenJob>) {
    while let Some(job) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        for text in &job.texts {
            if engine.pregen_gen.load(Ordering::SeqCst) != job.gen {
                break;
            }
            engine.generate_to_file(text, &job.opts).await;
        }
    }
}
