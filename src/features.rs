//! Runtime feature toggles.
//!
//! Named, aliased switches gating expensive subsystems (profiler,
//! shared memory, recording, ...). State persists to an INI-style file
//! keyed by feature id; changes bump an atomic generation counter so
//! hot paths can cache `is_enabled` results and refresh only when
//! something actually changed.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{info, warn};

// Canonical feature ids.
pub const DEBUG_MODE: &str = "debugmode";
pub const MEMORY_COUNTERS: &str = "memorycounters";
pub const CALL_TRACE: &str = "calltrace";
pub const OPCODE_PROFILER: &str = "opcodeprofiler";
pub const RECORDING: &str = "recording";
pub const SHARED_MEMORY: &str = "sharedmemory";

/// Metadata and current state of one toggle.
#[derive(Debug, Clone)]
pub struct FeatureInfo {
    pub id: String,
    pub alias: String,
    pub description: String,
    pub enabled: bool,
    pub mode: String,
    pub allowed_modes: Vec<String>,
    pub category: String,
}

impl FeatureInfo {
    pub fn new(
        id: &str,
        alias: &str,
        description: &str,
        allowed_modes: &[&str],
        category: &str,
    ) -> Self {
        Self {
            id: id.into(),
            alias: alias.into(),
            description: description.into(),
            enabled: false,
            mode: "default".into(),
            allowed_modes: allowed_modes.iter().map(|m| (*m).into()).collect(),
            category: category.into(),
        }
    }
}

struct Inner {
    features: HashMap<String, FeatureInfo>,
    aliases: HashMap<String, String>,
    dirty: bool,
    store_path: Option<PathBuf>,
}

impl Inner {
    fn resolve<'a>(&'a self, id_or_alias: &str) -> Option<&'a str> {
        if let Some((k, _)) = self.features.get_key_value(id_or_alias) {
            return Some(k.as_str());
        }
        self.aliases.get(id_or_alias).map(String::as_str)
    }
}

/// Thread-safe registry of feature toggles.
pub struct FeatureRegistry {
    inner: Mutex<Inner>,
    generation: AtomicU64,
}

impl FeatureRegistry {
    /// Create a registry with the default feature set. When
    /// `store_path` is given, every change is persisted there.
    pub fn new(store_path: Option<PathBuf>) -> Self {
        let registry = Self {
            inner: Mutex::new(Inner {
                features: HashMap::new(),
                aliases: HashMap::new(),
                dirty: false,
                store_path,
            }),
            generation: AtomicU64::new(0),
        };
        registry.set_defaults();
        registry
    }

    /// Monotonic change counter; bumped on every successful `set` /
    /// `set_mode` / `register` / `remove`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Registration ───────────────────────────────────────────

    pub fn register(&self, info: FeatureInfo) {
        let mut inner = self.lock();
        if !info.alias.is_empty() {
            inner.aliases.insert(info.alias.clone(), info.id.clone());
        }
        inner.features.insert(info.id.clone(), info);
        inner.dirty = true;
        drop(inner);
        self.bump();
    }

    pub fn remove(&self, id_or_alias: &str) {
        let mut inner = self.lock();
        let Some(id) = inner.resolve(id_or_alias).map(str::to_string) else {
            return;
        };
        if let Some(info) = inner.features.remove(&id) {
            inner.aliases.remove(&info.alias);
        }
        inner.dirty = true;
        drop(inner);
        self.bump();
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.features.clear();
        inner.aliases.clear();
        inner.dirty = true;
        drop(inner);
        self.bump();
    }

    /// Register the stock feature set, all disabled.
    pub fn set_defaults(&self) {
        {
            let mut inner = self.lock();
            inner.features.clear();
            inner.aliases.clear();
        }
        self.register(FeatureInfo::new(
            DEBUG_MODE,
            "dbg",
            "Master debug mode, enables all debug features",
            &["off", "on", "fast"],
            "debug",
        ));
        self.register(FeatureInfo::new(
            MEMORY_COUNTERS,
            "memcnt",
            "Collect memory access counters",
            &["off", "on", "default"],
            "analysis",
        ));
        self.register(FeatureInfo::new(
            CALL_TRACE,
            "ct",
            "Collect call trace information",
            &["off", "on", "minimal", "detailed"],
            "analysis",
        ));
        self.register(FeatureInfo::new(
            OPCODE_PROFILER,
            "op",
            "Track Z80 opcode execution stats and trace",
            &["off", "on", "default"],
            "analysis",
        ));
        self.register(FeatureInfo::new(
            RECORDING,
            "rec",
            "Enable the recording subsystem (video, audio capture)",
            &["off", "on", "default"],
            "debug",
        ));
        self.register(FeatureInfo::new(
            SHARED_MEMORY,
            "shm",
            "Export emulator memory via a shared memory region",
            &["off", "on", "default"],
            "performance",
        ));
        let mut inner = self.lock();
        inner.dirty = false;
    }

    // ── State changes ──────────────────────────────────────────

    /// Enable or disable a feature. Returns false when the id/alias is
    /// unknown.
    pub fn set(&self, id_or_alias: &str, enabled: bool) -> bool {
        let mut inner = self.lock();
        let Some(id) = inner.resolve(id_or_alias).map(str::to_string) else {
            return false;
        };
        let feature = inner.features.get_mut(&id).expect("resolved id present");
        if feature.enabled != enabled {
            feature.enabled = enabled;
            inner.dirty = true;
            drop(inner);
            self.bump();
            self.on_change();
        }
        true
    }

    /// Set a feature's mode. Fails (returns false) for an unknown
    /// feature or a mode outside its `allowed_modes`.
    pub fn set_mode(&self, id_or_alias: &str, mode: &str) -> bool {
        let mut inner = self.lock();
        let Some(id) = inner.resolve(id_or_alias).map(str::to_string) else {
            return false;
        };
        let feature = inner.features.get_mut(&id).expect("resolved id present");
        if !feature.allowed_modes.iter().any(|m| m == mode) {
            return false;
        }
        if feature.mode != mode {
            feature.mode = mode.to_string();
            inner.dirty = true;
            drop(inner);
            self.bump();
            self.on_change();
        }
        true
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn is_enabled(&self, id_or_alias: &str) -> bool {
        let inner = self.lock();
        inner
            .resolve(id_or_alias)
            .and_then(|id| inner.features.get(id))
            .map(|f| f.enabled)
            .unwrap_or(false)
    }

    pub fn mode_of(&self, id_or_alias: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .resolve(id_or_alias)
            .and_then(|id| inner.features.get(id))
            .map(|f| f.mode.clone())
    }

    pub fn info(&self, id_or_alias: &str) -> Option<FeatureInfo> {
        let inner = self.lock();
        inner
            .resolve(id_or_alias)
            .and_then(|id| inner.features.get(id))
            .cloned()
    }

    /// All registered features, sorted by id for stable display.
    pub fn list(&self) -> Vec<FeatureInfo> {
        let inner = self.lock();
        let mut features: Vec<FeatureInfo> = inner.features.values().cloned().collect();
        features.sort_by(|a, b| a.id.cmp(&b.id));
        features
    }

    // ── Persistence ────────────────────────────────────────────

    /// Persist when dirty. Called automatically after state changes.
    pub fn on_change(&self) {
        let path = {
            let inner = self.lock();
            if !inner.dirty {
                return;
            }
            inner.store_path.clone()
        };
        if let Some(path) = path {
            self.save_to(&path);
        }
    }

    /// Load states from an INI file. Unknown sections are ignored; a
    /// missing or unreadable file keeps the current state.
    pub fn load_from(&self, path: &Path) {
        if !path.exists() {
            return;
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("features: cannot read {}: {e}", path.display());
                return;
            }
        };

        let mut inner = self.lock();
        let mut section: Option<String> = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = Some(line[1..line.len() - 1].trim().to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            let Some(id) = section.clone() else { continue };
            let Some(feature) = inner.features.get_mut(&id) else {
                // Only registered features are overridden
                continue;
            };

            match key.as_str() {
                "state" => {
                    let v = value.to_ascii_lowercase();
                    feature.enabled = v == "on" || v == "true" || v == "1";
                }
                "mode" => {
                    feature.mode = value;
                }
                _ => {}
            }
        }

        inner.dirty = false;
        drop(inner);
        self.bump();
        info!("features: loaded from {}", path.display());
    }

    /// Save all feature states. Failures log and continue.
    pub fn save_to(&self, path: &Path) {
        let mut out = String::new();
        {
            let inner = self.lock();
            let mut ids: Vec<&String> = inner.features.keys().collect();
            ids.sort();
            for id in ids {
                let feature = &inner.features[id];
                let _ = writeln!(out, "[{id}]");
                let _ = writeln!(out, "state = {}", if feature.enabled { "on" } else { "off" });
                let _ = writeln!(out, "mode = {}", feature.mode);
                let _ = writeln!(out);
            }
        }

        if let Err(e) = fs::write(path, out) {
            warn!("features: cannot save {}: {e}", path.display());
            return;
        }

        let mut inner = self.lock();
        inner.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FeatureRegistry {
        FeatureRegistry::new(None)
    }

    #[test]
    fn test_defaults_registered_and_off() {
        let reg = registry();
        for id in [
            DEBUG_MODE,
            MEMORY_COUNTERS,
            CALL_TRACE,
            OPCODE_PROFILER,
            RECORDING,
            SHARED_MEMORY,
        ] {
            assert!(reg.info(id).is_some(), "{id} missing");
            assert!(!reg.is_enabled(id));
        }
        assert_eq!(reg.list().len(), 6);
    }

    #[test]
    fn test_set_by_id_and_alias() {
        let reg = registry();
        assert!(reg.set(OPCODE_PROFILER, true));
        assert!(reg.is_enabled(OPCODE_PROFILER));
        assert!(reg.is_enabled("op"));

        assert!(reg.set("op", false));
        assert!(!reg.is_enabled(OPCODE_PROFILER));

        assert!(!reg.set("nonexistent", true));
    }

    #[test]
    fn test_set_mode_validates_allowed_modes() {
        let reg = registry();
        assert!(reg.set_mode(CALL_TRACE, "detailed"));
        assert_eq!(reg.mode_of(CALL_TRACE).as_deref(), Some("detailed"));

        // Mode outside allowed_modes is rejected without mutation
        assert!(!reg.set_mode(CALL_TRACE, "verbose"));
        assert_eq!(reg.mode_of(CALL_TRACE).as_deref(), Some("detailed"));

        assert!(!reg.set_mode("nonexistent", "on"));
    }

    #[test]
    fn test_generation_tracks_changes() {
        let reg = registry();
        let g0 = reg.generation();

        reg.set(RECORDING, true);
        let g1 = reg.generation();
        assert!(g1 > g0);

        // No-op set does not bump
        reg.set(RECORDING, true);
        assert_eq!(reg.generation(), g1);
    }

    #[test]
    fn test_remove_and_clear() {
        let reg = registry();
        reg.remove("dbg");
        assert!(reg.info(DEBUG_MODE).is_none());
        assert!(!reg.set(DEBUG_MODE, true));

        reg.clear();
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.ini");

        let reg = FeatureRegistry::new(Some(path.clone()));
        reg.set(OPCODE_PROFILER, true);
        reg.set_mode(CALL_TRACE, "minimal");
        reg.set(SHARED_MEMORY, true);

        // Changes auto-persisted; a fresh registry reproduces them
        let other = FeatureRegistry::new(None);
        other.load_from(&path);
        assert!(other.is_enabled(OPCODE_PROFILER));
        assert!(other.is_enabled(SHARED_MEMORY));
        assert!(!other.is_enabled(RECORDING));
        assert_eq!(other.mode_of(CALL_TRACE).as_deref(), Some("minimal"));
    }

    #[test]
    fn test_load_ignores_unknown_sections_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.ini");
        std::fs::write(
            &path,
            "[frobnicator]\nstate = on\n\n[recording]\nstate = ON\nmode = default\nnot-a-kv-line\n",
        )
        .unwrap();

        let reg = registry();
        reg.load_from(&path);
        assert!(reg.is_enabled(RECORDING));
        assert!(reg.info("frobnicator").is_none());
    }

    #[test]
    fn test_load_missing_file_keeps_state() {
        let reg = registry();
        reg.set(RECORDING, true);
        reg.load_from(Path::new("/definitely/not/here/features.ini"));
        assert!(reg.is_enabled(RECORDING));
    }
}
