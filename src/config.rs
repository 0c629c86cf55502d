// Persistent configuration: TR-DOS interleave selection, turbo mode,
// feature store location. Stored as JSON in <config_dir>/spectral/config.json

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Interleave pattern index used when formatting loaded TRD images:
    /// 0 = sequential (TR-DOS 5.03), 1 = turbo (5.04T), 2 = compatibility.
    pub trdos_interleave: u8,
    /// Run the emulation unpaced.
    pub turbo: bool,
    /// Override path for features.ini (default: next to config.json).
    pub features_file: Option<String>,
    /// Last directory used when opening disk images.
    pub last_disk_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trdos_interleave: 1,
            turbo: false,
            features_file: None,
            last_disk_dir: None,
        }
    }
}

impl Config {
    /// Path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Default path for the feature store.
    pub fn features_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.features_file {
            return Some(PathBuf::from(path));
        }
        config_dir().map(|d| d.join("features.ini"))
    }

    /// Load config from disk, or return defaults if not found / invalid.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse_json(&content),
            Err(e) => {
                eprintln!("[spectral] Cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Save config to disk.
    pub fn save(&self) {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return,
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        if let Err(e) = std::fs::write(&path, self.to_json()) {
            eprintln!("[spectral] Cannot save config: {e}");
        }
    }

    /// Parse config from a JSON string. Unknown fields are ignored,
    /// missing fields get defaults.
    fn parse_json(s: &str) -> Self {
        let mut config = Self::default();

        // Simple manual JSON parsing to avoid a serde dependency.
        for line in s.lines() {
            let line = line.trim().trim_end_matches(',');
            if let Some(rest) = line.strip_prefix("\"trdos_interleave\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if let Ok(n) = val.parse::<u8>() {
                    config.trdos_interleave = n.min(2);
                }
            } else if let Some(rest) = line.strip_prefix("\"turbo\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                config.turbo = val == "true";
            } else if let Some(rest) = line.strip_prefix("\"features_file\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if val != "null" {
                    config.features_file = strip_json_string(val);
                }
            } else if let Some(rest) = line.strip_prefix("\"last_disk_dir\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if val != "null" {
                    config.last_disk_dir = strip_json_string(val);
                }
            }
        }

        config
    }

    /// Serialize config to a JSON string.
    fn to_json(&self) -> String {
        let fmt_opt = |v: &Option<String>| -> String {
            match v {
                Some(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
                None => "null".to_string(),
            }
        };
        format!(
            concat!(
                "{{\n",
                "  \"trdos_interleave\": {},\n",
                "  \"turbo\": {},\n",
                "  \"features_file\": {},\n",
                "  \"last_disk_dir\": {}\n",
                "}}\n",
            ),
            self.trdos_interleave,
            self.turbo,
            fmt_opt(&self.features_file),
            fmt_opt(&self.last_disk_dir),
        )
    }
}

/// Strip the quotes from a JSON string value.
fn strip_json_string(v: &str) -> Option<String> {
    let v = v.trim();
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        Some(v[1..v.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\"))
    } else {
        None
    }
}

/// Platform config directory for spectral.
fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("spectral"));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home).join(".config").join("spectral"));
        }
    }
    if let Ok(appdata) = std::env::var("APPDATA") {
        if !appdata.is_empty() {
            return Some(PathBuf::from(appdata).join("spectral"));
        }
    }
    None
}
