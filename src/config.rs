use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
// The room server truncates usernames to this length.
const MAX_USERNAME_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub username: String,
    pub initial_room: Option<String>,
    pub recordings_dir: PathBuf,
    pub ffmpeg_path: String,
    pub request_video: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            username: format!("user-{}", rand::random::<u32>()),
            initial_room: None,
            recordings_dir: PathBuf::from("."),
            ffmpeg_path: "ffmpeg".to_string(),
            request_video: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Builds a config from `CONFERENCE_*` variables; anything missing falls
    /// back to the defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(url) = vars.get("CONFERENCE_SIGNALING_URL") {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(Error::Config(format!(
                    "signaling url must be ws:// or wss://, got {}",
                    url
                )));
            }
            config.signaling_url = url.clone();
        }

        if let Some(servers) = vars.get("CONFERENCE_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(username) = vars.get("CONFERENCE_USERNAME") {
            config.username = sanitize_username(username)?;
        }

        config.initial_room = vars
            .get("CONFERENCE_ROOM")
            .map(|room| room.trim().to_string())
            .filter(|room| !room.is_empty());

        if let Some(dir) = vars.get("CONFERENCE_RECORDINGS_DIR") {
            config.recordings_dir = PathBuf::from(dir);
        }

        if let Some(ffmpeg) = vars.get("CONFERENCE_FFMPEG") {
            config.ffmpeg_path = ffmpeg.clone();
        }

        if let Some(video) = vars.get("CONFERENCE_VIDEO") {
            config.request_video = match video.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(Error::Config(format!(
                        "CONFERENCE_VIDEO must be a boolean, got {}",
                        other
                    )))
                }
            };
        }

        Ok(config)
    }
}

fn sanitize_username(raw: &str) -> Result<String> {
    let trimmed: String = raw.trim().chars().take(MAX_USERNAME_LEN).collect();
    if trimmed.is_empty() {
        return Err(Error::Config("Invalid username".to_string()));
    }
    Ok(trimmed)
}
