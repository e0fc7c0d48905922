use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "voice-chat-client";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the voice-chat server.
    pub server_url: String,

    /// Path of the SDP offer endpoint, appended to `server_url`.
    pub offer_path: String,

    /// Label of the text data channel. The server expects "chat".
    pub data_channel_label: String,

    /// STUN/TURN URLs. Empty means host candidates only.
    pub ice_servers: Vec<String>,

    /// Upper bound on waiting for ICE gathering before the offer is sent.
    pub ice_gathering_timeout_ms: u64,

    /// Timeout for the offer/answer HTTP request.
    pub http_timeout_secs: u64,

    /// Check microphone access before connecting. Disable on hosts without an input device.
    pub require_microphone: bool,

    /// Play the received audio track. When disabled the track is still drained.
    pub audio_playback: bool,

    /// Characters of speech text shown on the audio status.
    pub preview_chars: usize,

    /// Connect as soon as the client starts.
    pub auto_connect: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            offer_path: "/offer".to_string(),
            data_channel_label: "chat".to_string(),
            ice_servers: Vec::new(),
            ice_gathering_timeout_ms: 5000,
            http_timeout_secs: 30,
            require_microphone: true,
            audio_playback: true,
            preview_chars: crate::chat::DEFAULT_PREVIEW_CHARS,
            auto_connect: true,
        }
    }
}

impl ClientSettings {
    /// Apply `VOICE_CHAT_*` environment variables on top of the current values.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("VOICE_CHAT_SERVER_URL") {
            self.server_url = url.trim().to_string();
        }
        if let Some(path) = get("VOICE_CHAT_OFFER_PATH") {
            self.offer_path = path.trim().to_string();
        }
        if let Some(servers) = get("VOICE_CHAT_ICE_SERVERS") {
            self.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = get("VOICE_CHAT_REQUIRE_MIC") {
            match parse_bool(&value) {
                Some(b) => self.require_microphone = b,
                None => log::warn!("Settings: ignoring VOICE_CHAT_REQUIRE_MIC={:?}", value),
            }
        }
        if let Some(value) = get("VOICE_CHAT_AUTO_CONNECT") {
            match parse_bool(&value) {
                Some(b) => self.auto_connect = b,
                None => log::warn!("Settings: ignoring VOICE_CHAT_AUTO_CONNECT={:?}", value),
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the config directory, then apply environment overrides.
/// Never fails: problems are logged and defaults used.
pub fn load_settings() -> ClientSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_or_create(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

pub fn load_from_path(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

/// Like `load_from_path`, but a missing file is created with the defaults so
/// there is something to edit.
pub fn load_or_create(path: &Path) -> ClientSettings {
    if path.exists() {
        return load_from_path(path);
    }

    let settings = ClientSettings::default();
    match save_to_path(path, &settings) {
        Ok(()) => log::info!("Settings: wrote defaults to {:?}", path),
        Err(e) => log::warn!("Settings: {}", e),
    }
    settings
}

pub fn save_to_path(path: &Path, settings: &ClientSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
