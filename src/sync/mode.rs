use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How eagerly an entity is refetched from the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Never contact the archive; serve what is stored.
    NoFetch,
    /// Refetch once the staleness window has passed.
    #[default]
    UpdateStale,
    /// Refetch regardless of freshness.
    Force,
}

impl FetchMode {
    /// Decide whether an entity last refreshed at `updated` must be fetched.
    pub fn should_fetch(self, updated: i64, window: Duration) -> bool {
        match self {
            FetchMode::NoFetch => false,
            FetchMode::UpdateStale => crate::db::is_stale(updated, window),
            FetchMode::Force => true,
        }
    }
}

/// Fetch modes for each entity level, passed explicitly through a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchModes {
    /// Account-wide refresh.
    pub user: FetchMode,
    /// Collection listings.
    pub feed: FetchMode,
    /// Individual works.
    pub work: FetchMode,
}

impl FetchModes {
    /// Everything forced.
    pub fn force() -> Self {
        Self {
            user: FetchMode::Force,
            feed: FetchMode::Force,
            work: FetchMode::Force,
        }
    }

    /// Modes to use after the AO3 username of an account changed.
    ///
    /// Every listing is refetched so entries belonging to the previous identity
    /// get pruned. Nothing is deleted up front.
    pub fn escalate_for_identity_change(self) -> Self {
        Self {
            user: FetchMode::Force,
            feed: FetchMode::Force,
            work: self.work,
        }
    }
}

impl From<&crate::config::SyncConfig> for FetchModes {
    fn from(config: &crate::config::SyncConfig) -> Self {
        Self {
            user: config.user_mode,
            feed: config.feed_mode,
            work: config.work_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_timestamp;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn staleness_gate() {
        let fresh = now_timestamp() - 60;
        let stale = now_timestamp() - 7200;

        assert!(!FetchMode::UpdateStale.should_fetch(fresh, HOUR));
        assert!(FetchMode::UpdateStale.should_fetch(stale, HOUR));
        assert!(FetchMode::Force.should_fetch(fresh, HOUR));
        assert!(!FetchMode::NoFetch.should_fetch(stale, HOUR));
        assert!(!FetchMode::NoFetch.should_fetch(0, HOUR));
    }

    #[test]
    fn identity_change_forces_listings_only() {
        let modes = FetchModes::default().escalate_for_identity_change();
        assert_eq!(modes.user, FetchMode::Force);
        assert_eq!(modes.feed, FetchMode::Force);
        assert_eq!(modes.work, FetchMode::UpdateStale);
    }

    #[test]
    fn modes_parse_from_config() {
        let config: crate::config::SyncConfig =
            toml::from_str("feed_mode = \"force\"\nwork_mode = \"no_fetch\"").unwrap();
        let modes = FetchModes::from(&config);
        assert_eq!(modes.user, FetchMode::UpdateStale);
        assert_eq!(modes.feed, FetchMode::Force);
        assert_eq!(modes.work, FetchMode::NoFetch);
    }
}
