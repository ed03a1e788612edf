use std::{fmt, fs, path::Path, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub type PinId = u32;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PullMode {
    #[default]
    Off,
    Down,
    Up,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether an observed edge satisfies this requested edge.
    pub fn matches(self, observed: Edge) -> bool {
        match self {
            Edge::Both => true,
            requested => requested == observed || observed == Edge::Both,
        }
    }

    pub fn union(self, other: Edge) -> Edge {
        if self == other { self } else { Edge::Both }
    }
}

impl TryFrom<u8> for Direction {
    type Error = GpioError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            _ => Err(GpioError::Configuration(format!("unknown direction code {code}"))),
        }
    }
}

impl TryFrom<u8> for PullMode {
    type Error = GpioError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PullMode::Off),
            1 => Ok(PullMode::Down),
            2 => Ok(PullMode::Up),
            _ => Err(GpioError::Configuration(format!("unknown pull mode code {code}"))),
        }
    }
}

impl TryFrom<u8> for Edge {
    type Error = GpioError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Edge::Rising),
            2 => Ok(Edge::Falling),
            3 => Ok(Edge::Both),
            _ => Err(GpioError::Configuration(format!("unknown edge code {code}"))),
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "out" | "output" => Ok(Direction::Out),
            "in" | "input" => Ok(Direction::In),
            other => Err(GpioError::Configuration(format!("unknown direction '{other}'"))),
        }
    }
}

impl FromStr for PullMode {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(PullMode::Off),
            "down" => Ok(PullMode::Down),
            "up" => Ok(PullMode::Up),
            other => Err(GpioError::Configuration(format!("unknown pull mode '{other}'"))),
        }
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(GpioError::Configuration(format!("unknown edge '{other}'"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Out => "out",
            Direction::In => "in",
        })
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        })
    }
}

/// Where a board-neutral pin id lives on the GPIO character devices.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SwitchConfig {
    pub name: String,
    pub pin: PinId,
    #[serde(default = "SwitchConfig::default_pull")]
    pub pull: PullMode,
    #[serde(default = "SwitchConfig::default_edge")]
    pub edge: Edge,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl SwitchConfig {
    fn default_pull() -> PullMode {
        PullMode::Up
    }

    fn default_edge() -> Edge {
        Edge::Falling
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub pins: FxHashMap<PinId, PinConfig>,
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
    #[serde(default = "AppConfig::default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl AppConfig {
    fn default_event_queue_capacity() -> usize {
        64
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Configuration(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| GpioError::Configuration(format!("Invalid config json: {e}")))?;
        if config.event_queue_capacity == 0 {
            return Err(GpioError::Configuration(
                "event_queue_capacity must be positive".into(),
            ));
        }
        Ok(config)
    }
}
