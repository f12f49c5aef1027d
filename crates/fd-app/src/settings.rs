use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use serde_json::{Map, Value, json};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Keys that must hold a non-negative number; `safe_set` drops anything else.
const GEOMETRY_KEYS: &[&str] = &["window_width", "window_height", "window_x", "window_y"];
const SCALE_KEYS: &[&str] = &["default_guidance_scale", "default_strength"];

pub fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "api_key": "",
        "default_model": "fal-ai/flux/dev",
        "default_prompt": "A beautiful landscape with mountains and cherry blossoms",
        "default_negative_prompt": "",
        "default_image_size": "landscape_4_3",
        "default_custom_width": 1024,
        "default_custom_height": 768,
        "default_inference_steps": 28,
        "default_guidance_scale": 3.5,
        "default_num_images": 1,
        "default_use_custom_size": false,
        "enable_safety_checker": true,
        "default_strength": 0.95,
        "window_width": 900,
        "window_height": 1200,
        "window_x": null,
        "window_y": null,
        "last_mode": "text-to-image",
        "auto_save_prompts": true,
    });
    match defaults {
        Value::Object(map) => map,
        _ => unreachable!("defaults literal is an object"),
    }
}

enum FlushSignal {
    Dirty,
    Shutdown,
}

struct Inner {
    values: Map<String, Value>,
    /// Bumped on every mutation.
    generation: u64,
    /// Generation last written to disk.
    flushed: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Serializes disk writes. Held only around file I/O, never together
    /// with a freshly taken `inner` guard, so `set` stays lock-cheap while
    /// a flush is writing.
    io: Mutex<()>,
}

impl Shared {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation; the map itself is
        // still a valid snapshot.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Durable key/value settings. Mutations are coalesced: each `set` re-arms
/// a single debounce timer and only a quiet period triggers a disk write,
/// so slider drags and keystrokes cost one write, not hundreds.
///
/// Flush failures are logged and swallowed; the in-memory map stays
/// authoritative and the next successful flush carries the latest values.
pub struct SettingsStore {
    shared: Arc<Shared>,
    path: PathBuf,
    tx: Sender<FlushSignal>,
    flusher: Option<JoinHandle<()>>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_debounce(path, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(path: impl Into<PathBuf>, delay: Duration) -> Self {
        let path = path.into();
        let values = load_values(&path);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                values,
                generation: 0,
                flushed: 0,
            }),
            io: Mutex::new(()),
        });

        let (tx, rx) = channel();
        let flusher = thread::spawn({
            let shared = shared.clone();
            let path = path.clone();
            move || flush_loop(rx, shared, path, delay)
        });

        Self {
            shared,
            path,
            tx,
            flusher: Some(flusher),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)?.as_str().map(str::to_string)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        {
            let mut inner = self.lock();
            inner.values.insert(key.to_string(), value.into());
            inner.generation += 1;
        }
        let _ = self.tx.send(FlushSignal::Dirty);
    }

    pub fn update(&self, entries: Map<String, Value>) {
        {
            let mut inner = self.lock();
            for (key, value) in entries {
                inner.values.insert(key, value);
            }
            inner.generation += 1;
        }
        let _ = self.tx.send(FlushSignal::Dirty);
    }

    /// Tolerant `set`: type-incoherent values (negative geometry, non-numeric
    /// scale) are dropped silently and the prior value is kept.
    pub fn safe_set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            return;
        }

        let numeric_gate = GEOMETRY_KEYS.contains(&key) || SCALE_KEYS.contains(&key);
        if numeric_gate {
            match value.as_f64() {
                Some(n) if n >= 0.0 => {}
                _ => {
                    warn!("ignoring invalid value for {}: {}", key, value);
                    return;
                }
            }
        }

        self.set(key, value);
    }

    /// Tolerant `get`: an empty-string value counts as unset.
    pub fn safe_get(&self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Some(Value::String(s)) if s.is_empty() => default,
            Some(value) => value,
            None => default,
        }
    }

    /// Full copy of the in-memory map.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().values.clone()
    }

    /// Synchronous flush, bypassing the debounce. The shutdown path calls
    /// this; it must complete or fail loudly before the process exits.
    pub fn save_now(&self) -> std::io::Result<()> {
        let (values, generation) = {
            let inner = self.shared.lock_inner();
            (inner.values.clone(), inner.generation)
        };
        write_snapshot(&self.shared, &self.path, &values, generation)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.lock_inner()
    }
}

impl Drop for SettingsStore {
    fn drop(&mut self) {
        let _ = self.tx.send(FlushSignal::Shutdown);
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

/// Read and merge settings. Stored values win; defaults only fill missing
/// keys. Unknown keys are kept verbatim. Never errors: a missing file is
/// created from defaults, an unreadable one falls back to defaults.
fn load_values(path: &Path) -> Map<String, Value> {
    let defaults = default_settings();

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no settings at {}, creating defaults", path.display());
            if let Err(e) = write_atomic(path, &defaults) {
                warn!("failed to write default settings: {}", e);
            }
            return defaults;
        }
        Err(e) => {
            error!("failed to read {}: {}", path.display(), e);
            return defaults;
        }
    };

    match serde_json::from_str::<Map<String, Value>>(&text) {
        Ok(mut values) => {
            for (key, value) in defaults {
                values.entry(key).or_insert(value);
            }
            values
        }
        Err(e) => {
            error!("settings file {} is corrupt: {}", path.display(), e);
            defaults
        }
    }
}

fn flush_loop(rx: Receiver<FlushSignal>, shared: Arc<Shared>, path: PathBuf, delay: Duration) {
    loop {
        match rx.recv() {
            Ok(FlushSignal::Dirty) => {}
            Ok(FlushSignal::Shutdown) | Err(_) => return,
        }

        // Re-arm the timer on every further mutation; write only after a
        // full quiet period, and always the latest snapshot.
        loop {
            match rx.recv_timeout(delay) {
                Ok(FlushSignal::Dirty) => continue,
                Ok(FlushSignal::Shutdown) => {
                    flush_latest(&shared, &path);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    flush_latest(&shared, &path);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn flush_latest(shared: &Shared, path: &Path) {
    let (values, generation) = {
        let inner = shared.lock_inner();
        if inner.flushed == inner.generation {
            // save_now already wrote this generation
            return;
        }
        (inner.values.clone(), inner.generation)
    };
    if let Err(e) = write_snapshot(shared, path, &values, generation) {
        warn!("settings flush failed: {}", e);
    }
}

/// Write a snapshot taken at `generation`. The values mutex is released
/// before the file write, so foreground `set` calls never wait on disk
/// I/O; competing writers serialize on the io lock and a stale snapshot
/// loses to any newer one already flushed.
fn write_snapshot(
    shared: &Shared,
    path: &Path,
    values: &Map<String, Value>,
    generation: u64,
) -> std::io::Result<()> {
    let _io = shared.io.lock().unwrap_or_else(|e| e.into_inner());
    if shared.lock_inner().flushed > generation {
        return Ok(());
    }
    write_atomic(path, values)?;
    let mut inner = shared.lock_inner();
    if inner.flushed < generation {
        inner.flushed = generation;
    }
    Ok(())
}

/// Whole-file atomic replace: out-of-process readers never observe a
/// half-written file.
fn write_atomic(path: &Path, values: &Map<String, Value>) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(values).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}
