use serde::{Deserialize, Serialize};

/// Rendition of an asset to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSize {
    Original,
    Medium,
    Thumb,
}

impl VersionSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionSize::Original => "original",
            VersionSize::Medium => "medium",
            VersionSize::Thumb => "thumb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Domain {
    Com,
    Cn,
}

impl Domain {
    pub fn as_str(&self) -> &str {
        match self {
            Domain::Com => "com",
            Domain::Cn => "cn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How local file names are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FileStructure {
    /// Cleaned remote record id.
    #[default]
    Id,
    /// Cleaned original file name.
    Name,
}
