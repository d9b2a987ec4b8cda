//! Task priority tiers.

use serde::{Deserialize, Serialize};

/// One of five strictly ordered priority tiers.
///
/// `Ord` follows urgency: `Critical > High > Normal > Low > Background`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Number of tiers.
    pub const COUNT: usize = 5;

    /// Tiers from most to least urgent.
    pub const DESCENDING: [Priority; Self::COUNT] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Queue slot index, 0 being the most urgent tier.
    pub fn tier(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }

    /// Lowercase label used in metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    /// Parse a label, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_ascii_lowercase();
        Self::DESCENDING.into_iter().find(|p| p.as_label() == lower)
    }
}
