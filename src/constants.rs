//! Configuration constants for the Taprace game engine
//!
//! This module contains all the limits, defaults, and clamping bounds
//! used throughout the engine. Host-supplied values outside the documented
//! bounds are clamped, never rejected.

/// Game-wide limits
pub mod game {
    /// Default maximum number of players in a single round
    pub const DEFAULT_MAX_PLAYERS: usize = 200;
    /// Hard ceiling on participants of any kind (players, hosts, displays)
    pub const MAX_WATCHER_COUNT: usize = 500;
}

/// Round timing bounds and defaults (all in seconds)
pub mod round {
    /// Default length of the pre-stage countdown
    pub const DEFAULT_COUNTDOWN_SECONDS: u64 = 3;
    /// Minimum allowed countdown length
    pub const MIN_COUNTDOWN_SECONDS: u64 = 1;
    /// Maximum allowed countdown length
    pub const MAX_COUNTDOWN_SECONDS: u64 = 10;

    /// Default length of the stage-1 tapping window
    pub const DEFAULT_STAGE1_SECONDS: u64 = 10;
    /// Minimum allowed stage-1 window length
    pub const MIN_STAGE1_SECONDS: u64 = 1;
    /// Maximum allowed stage-1 window length
    pub const MAX_STAGE1_SECONDS: u64 = 300;

    /// Default length of the stage-2 reaction window
    pub const DEFAULT_STAGE2_SECONDS: u64 = 5;
    /// Minimum allowed stage-2 window length
    pub const MIN_STAGE2_SECONDS: u64 = 1;
    /// Maximum allowed stage-2 window length
    pub const MAX_STAGE2_SECONDS: u64 = 60;
}

/// Click-rate limiter configuration
pub mod rate_limit {
    /// Length of the sliding window in milliseconds
    pub const WINDOW_MILLIS: u64 = 1000;
    /// Default maximum number of clicks accepted within the window
    pub const DEFAULT_MAX_CLICKS_PER_WINDOW: usize = 20;
}

/// Timing anomaly detector configuration
pub mod anomaly {
    /// Capacity of the per-connection ring buffer of inter-click intervals
    pub const DEFAULT_INTERVAL_CAPACITY: usize = 50;
    /// Minimum number of intervals required before classification
    pub const DEFAULT_MIN_SAMPLES: usize = 10;
    /// Coefficient-of-variation threshold below which timing is flagged
    pub const DEFAULT_CV_THRESHOLD: f64 = 0.15;
}

/// Session store configuration
pub mod session {
    /// How long a disconnected player's identity remains reclaimable
    pub const GRACE_PERIOD_SECONDS: u64 = 30;
    /// Interval between defensive sweeps of expired sessions
    pub const SWEEP_INTERVAL_SECONDS: u64 = 15;
}

/// Player identity limits
pub mod player {
    /// Maximum length of a display name in characters
    pub const MAX_NAME_LENGTH: usize = 30;
    /// Maximum length of the winner's ad message in characters
    pub const MAX_AD_MESSAGE_LENGTH: usize = 120;
    /// Fixed palette of player colors, assigned round-robin at join
    pub const COLOR_PALETTE: [&str; 10] = [
        "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
        "#bcf60c", "#008080",
    ];
}

/// Leaderboard display limits
pub mod leaderboard {
    /// Maximum number of entries shown in broadcast leaderboards
    pub const DISPLAY_LIMIT: usize = 50;
}

/// All-time historical standings limits
pub mod records {
    /// Maximum number of all-time standings entries in a broadcast
    pub const TOP_LIMIT: usize = 20;
}
