//! Types for the checkpoint store.

/// Download status of a checkpointed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    /// Listed remotely, not yet on disk.
    Pending,
    /// Materialized locally.
    Done,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// Counts shown by the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub pending: u64,
    pub done: u64,
    /// Albums with a live scan offset, with that offset.
    pub offsets: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [AssetStatus::Pending, AssetStatus::Done] {
            assert_eq!(AssetStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AssetStatus::from_str("downloaded"), None);
    }
}
