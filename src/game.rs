//! Round state machine, event dispatch, and the broadcast gateway
//!
//! This module contains the authoritative game engine: the phase sequencer
//! driving a round from lobby through both tap stages to the frozen final
//! leaderboard, the per-event dispatch for player and host messages, and
//! the broadcast gateway that pushes one identical state snapshot to every
//! connected console after each visible mutation.
//!
//! All timing is server-owned. Phase countdowns are one-second tick alarms
//! scheduled through the embedder's scheduler; each alarm carries the round
//! number and phase it was armed for, and stale alarms are discarded, so
//! starting or resetting a round structurally cancels everything armed
//! before it.

use std::{collections::HashMap, fmt::Debug};

use garde::Validate;
use rustrict::CensorStr;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use web_time::{Duration, SystemTime};

use crate::{
    TruncatedVec,
    anomaly::AnomalyDetector,
    constants,
    leaderboard::{self, FrozenLeaderboard, LiveEntry, Winner},
    names::Names,
    player::{self, Player},
    rate_limit::RateLimiter,
    reconnect::{self, SessionStore, SessionToken},
    session::Tunnel,
    stats::{AllTimeRecord, AllTimeRecords, RecordStore, Standing},
    watcher::{self, Id, PlayerValue, Value, ValueKind, Watchers},
};

/// Phase of the round state machine
///
/// `Lobby` accepts joins and ignores clicks; the two countdown phases build
/// anticipation; `Stage1Active` counts taps; `Stage2Active` records each
/// player's first-tap reaction time; `Finished` exposes the frozen final
/// leaderboard until the host starts a new round or reopens the lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for players; registration open
    #[default]
    Lobby,
    /// Countdown before the tap-counting stage
    Stage1Countdown,
    /// The tap-counting window
    Stage1Active,
    /// Countdown announcing the reaction-time mini-game
    Stage2Countdown,
    /// The reaction-time window
    Stage2Active,
    /// Round over; final leaderboard frozen
    Finished,
}

impl Phase {
    /// Whether a round is currently underway
    ///
    /// Starting a round is rejected in these phases to prevent overlapping
    /// rounds and duplicate timers.
    fn round_in_progress(self) -> bool {
        matches!(
            self,
            Phase::Stage1Countdown
                | Phase::Stage1Active
                | Phase::Stage2Countdown
                | Phase::Stage2Active
        )
    }
}

/// Host-supplied timing overrides for one round
///
/// Absent fields use the defaults; present fields are clamped to the
/// documented bounds, never rejected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SettingsOverrides {
    /// Countdown length in seconds for both stages
    pub countdown_seconds: Option<u64>,
    /// Stage-1 tap window length in seconds
    pub stage1_seconds: Option<u64>,
    /// Stage-2 reaction window length in seconds
    pub stage2_seconds: Option<u64>,
}

/// Resolved per-round timing, already clamped
#[serde_with::serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoundSettings {
    /// Countdown length for both stages
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    countdown: Duration,
    /// Stage-1 tap window length
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    stage1: Duration,
    /// Stage-2 reaction window length
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    stage2: Duration,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self::clamped(SettingsOverrides::default())
    }
}

impl RoundSettings {
    /// Resolves host overrides into clamped round timing
    pub fn clamped(overrides: SettingsOverrides) -> Self {
        use crate::constants::round::*;

        let clamp = |value: Option<u64>, default: u64, min: u64, max: u64| {
            Duration::from_secs(value.unwrap_or(default).clamp(min, max))
        };

        Self {
            countdown: clamp(
                overrides.countdown_seconds,
                DEFAULT_COUNTDOWN_SECONDS,
                MIN_COUNTDOWN_SECONDS,
                MAX_COUNTDOWN_SECONDS,
            ),
            stage1: clamp(
                overrides.stage1_seconds,
                DEFAULT_STAGE1_SECONDS,
                MIN_STAGE1_SECONDS,
                MAX_STAGE1_SECONDS,
            ),
            stage2: clamp(
                overrides.stage2_seconds,
                DEFAULT_STAGE2_SECONDS,
                MIN_STAGE2_SECONDS,
                MAX_STAGE2_SECONDS,
            ),
        }
    }

    /// The configured length of a given timed phase, in whole seconds
    fn phase_seconds(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Stage1Countdown | Phase::Stage2Countdown => self.countdown.as_secs(),
            Phase::Stage1Active => self.stage1.as_secs(),
            Phase::Stage2Active => self.stage2.as_secs(),
            Phase::Lobby | Phase::Finished => 0,
        }
    }
}

/// One full game cycle's state
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct Round {
    /// Current phase
    phase: Phase,
    /// Monotonically increasing round counter; also the generation tag
    /// that invalidates stale timers
    number: u64,
    /// Seconds left in the current timed phase
    time_remaining: u64,
    /// Resolved timing for this round
    settings: RoundSettings,
    /// When the stage-2 window opened, for reaction measurement
    stage2_opened_at: Option<SystemTime>,
    /// The frozen final leaderboard, computed exactly once at finish
    final_board: once_cell_serde::sync::OnceCell<FrozenLeaderboard>,
}

/// Embedder-supplied engine configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct Options {
    /// Maximum number of simultaneous players
    #[garde(range(min = 1, max = 1000))]
    pub max_players: usize,
    /// Click-rate ceiling per connection per second
    #[garde(range(min = 1, max = 100))]
    pub max_clicks_per_second: usize,
    /// Ring buffer capacity of the timing anomaly detector
    #[garde(range(min = 2, max = 500))]
    pub anomaly_interval_capacity: usize,
    /// Minimum interval samples before anomaly classification
    #[garde(range(min = 2, max = 500))]
    pub anomaly_min_samples: usize,
    /// Coefficient-of-variation threshold for the anomaly detector
    #[garde(range(min = 0.0, max = 1.0))]
    pub anomaly_cv_threshold: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_players: constants::game::DEFAULT_MAX_PLAYERS,
            max_clicks_per_second: constants::rate_limit::DEFAULT_MAX_CLICKS_PER_WINDOW,
            anomaly_interval_capacity: constants::anomaly::DEFAULT_INTERVAL_CAPACITY,
            anomaly_min_samples: constants::anomaly::DEFAULT_MIN_SAMPLES,
            anomaly_cv_threshold: constants::anomaly::DEFAULT_CV_THRESHOLD,
        }
    }
}

/// Messages received from different types of consoles
///
/// Each inbound event is a tagged variant with its own validated,
/// bounded-field schema; a message whose tag does not match the sender's
/// registered role is dropped before it can reach state mutation.
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingMessage {
    /// Messages from connections that have not joined yet
    Unassigned(IncomingUnassignedMessage),
    /// Messages from active players
    Player(IncomingPlayerMessage),
    /// Messages from the host control surface
    Host(IncomingHostMessage),
}

impl IncomingMessage {
    /// Validates that a message matches the sender's registered role
    fn follows(&self, sender_kind: ValueKind) -> bool {
        matches!(
            (self, sender_kind),
            (IncomingMessage::Host(_), ValueKind::Host)
                | (IncomingMessage::Player(_), ValueKind::Player)
                | (IncomingMessage::Unassigned(_), ValueKind::Unassigned)
        )
    }
}

/// Messages from connections that have not joined yet
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingUnassignedMessage {
    /// Request to join the round as a player
    Join {
        /// Requested display name (sanitized and defaulted server-side)
        name: String,
        /// Ad message to show on a win (sanitized and bounded)
        ad_message: String,
    },
    /// Request to reclaim a previous session
    Reconnect {
        /// The token handed out at join time
        token: String,
    },
}

/// Messages from active players
#[derive(Debug, Deserialize, Clone, Copy)]
pub enum IncomingPlayerMessage {
    /// A button tap; no payload, the effect depends entirely on the
    /// current phase and per-connection limiter/detector state
    Click,
}

/// Messages from the host control surface
#[derive(Debug, Deserialize, Clone, Copy)]
pub enum IncomingHostMessage {
    /// Start a new round with optional timing overrides
    Start(SettingsOverrides),
    /// Reopen registration after a finished round
    OpenLobby,
    /// Force an immediate return to the lobby, cancelling all timers
    Reset,
    /// Administrative reset of the all-time standings
    ResetStats,
}

/// Why a join request was refused
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The round is at its configured player capacity
    #[error("game is full")]
    Full,
    /// The round has finished; the host must reopen the lobby
    #[error("round is over, wait for the next one")]
    RoundOver,
}

/// Why a host command was refused
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// A round is underway; its timers must finish or be reset first
    #[error("a round is already in progress")]
    RoundInProgress,
}

/// The leaderboard appropriate to the current phase
#[derive(Debug, Serialize, Clone)]
pub enum PhaseLeaderboard {
    /// Ranked view over the live player table
    Live(TruncatedVec<LiveEntry>),
    /// The immutable snapshot captured at round finish
    Final(FrozenLeaderboard),
}

/// The shared broadcast payload
///
/// Pushed identically to every connected console after each visible
/// mutation; personalization ("did I win") is derived client-side by
/// matching on the recipient's own identity within this shared shape.
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub struct GameSnapshot {
    /// Current phase
    pub phase: Phase,
    /// Current round number
    pub round_number: u64,
    /// Seconds left in the current timed phase
    pub time_remaining: u64,
    /// Number of currently connected players
    pub player_count: usize,
    /// Live or frozen leaderboard, per phase
    pub leaderboard: PhaseLeaderboard,
    /// Winner and ad payload, present only when finished
    pub winner: Option<Winner>,
    /// Capped all-time historical standings
    pub all_time: TruncatedVec<Standing>,
}

/// Update messages about game state changes
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// The shared broadcast payload
    Snapshot(GameSnapshot),
    /// A join request was refused, with the reason
    JoinRejected(JoinError),
    /// A host command was refused, with the reason
    HostRejected(HostError),
}

/// Full-state synchronization for (re)connecting consoles
#[derive(Debug, Serialize, Clone)]
pub enum SyncMessage {
    /// The shared broadcast payload
    Snapshot(GameSnapshot),
}

/// Alarm messages for round-scoped timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// One-second countdown tick for a timed phase
    ///
    /// Carries the round number and phase it was armed for; a tick that no
    /// longer matches current state is stale and discarded.
    Tick {
        /// Round generation the tick belongs to
        round_number: u64,
        /// Phase the tick was armed in
        phase: Phase,
    },
}

/// Serialization helper for the engine
#[derive(Deserialize)]
struct GameSerde {
    options: Options,
    watchers: Watchers,
    names: Names,
    players: HashMap<Id, Player>,
    join_counter: usize,
    round: Round,
    sessions: SessionStore,
    records: AllTimeRecords,
}

/// The authoritative game engine for one tapping competition
///
/// Single-writer: all mutations happen as discrete reactions to inbound
/// messages, disconnect notifications, and alarms delivered by the
/// embedder's event loop. Within one event, state is fully updated before
/// the broadcast for that event is composed.
#[derive(Serialize, Deserialize)]
#[serde(from = "GameSerde")]
pub struct Game {
    /// Engine configuration
    options: Options,
    /// Registry of all attached consoles
    pub watchers: Watchers,
    /// Display-name registry
    names: Names,
    /// The round's live player table, keyed by connection id
    players: HashMap<Id, Player>,
    /// Monotonic join counter; assigns join order and palette colors
    join_counter: usize,
    /// Current round state
    round: Round,
    /// Reclaimable disconnected-player sessions
    sessions: SessionStore,
    /// All-time historical standings
    records: AllTimeRecords,
    /// Per-connection click-rate limiter (transient, rebuilt on restore)
    #[serde(skip_serializing)]
    rate_limiter: RateLimiter,
    /// Per-connection timing anomaly detector (transient)
    #[serde(skip_serializing)]
    anomaly: AnomalyDetector,
    /// Whether the recurring session sweep alarm has been armed
    #[serde(skip_serializing)]
    sweep_armed: bool,
}

impl From<GameSerde> for Game {
    fn from(serde: GameSerde) -> Self {
        let GameSerde {
            options,
            watchers,
            names,
            players,
            join_counter,
            round,
            sessions,
            records,
        } = serde;
        Self {
            rate_limiter: RateLimiter::new(options.max_clicks_per_second),
            anomaly: AnomalyDetector::new(
                options.anomaly_interval_capacity,
                options.anomaly_min_samples,
                options.anomaly_cv_threshold,
            ),
            sweep_armed: false,
            options,
            watchers,
            names,
            players,
            join_counter,
            round,
            sessions,
            records,
        }
    }
}

impl Debug for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("phase", &self.round.phase)
            .field("round_number", &self.round.number)
            .field("player_count", &self.players.len())
            .finish_non_exhaustive()
    }
}

/// Sanitizes the free-text ad message from a join request
fn sanitize_ad_message(raw: &str) -> String {
    let bounded: String = rustrict::trim_whitespace(raw)
        .chars()
        .take(constants::player::MAX_AD_MESSAGE_LENGTH)
        .collect();
    bounded.censor()
}

impl Game {
    /// Creates an engine with the host console attached
    ///
    /// # Arguments
    ///
    /// * `options` - Engine configuration, validated by the embedder
    /// * `host_id` - Connection id of the host console
    /// * `records` - All-time record map loaded from the record store at
    ///   startup (see [`crate::stats::load_or_empty`])
    pub fn new(options: Options, host_id: Id, records: HashMap<String, AllTimeRecord>) -> Self {
        Self {
            rate_limiter: RateLimiter::new(options.max_clicks_per_second),
            anomaly: AnomalyDetector::new(
                options.anomaly_interval_capacity,
                options.anomaly_min_samples,
                options.anomaly_cv_threshold,
            ),
            options,
            watchers: Watchers::with_host_id(host_id),
            names: Names::default(),
            players: HashMap::new(),
            join_counter: 0,
            round: Round::default(),
            sessions: SessionStore::default(),
            records: AllTimeRecords::new(records),
            sweep_armed: false,
        }
    }

    /// Current phase of the round state machine
    pub fn phase(&self) -> Phase {
        self.round.phase
    }

    /// Current round number
    pub fn round_number(&self) -> u64 {
        self.round.number
    }

    /// Composes the shared broadcast payload from current state
    pub fn snapshot(&self) -> GameSnapshot {
        let (leaderboard, winner) = match self.round.final_board.get() {
            Some(frozen) => (
                PhaseLeaderboard::Final(frozen.clone()),
                frozen.winner.clone(),
            ),
            None => {
                let live = leaderboard::live(self.players.values());
                let count = live.len();
                (
                    PhaseLeaderboard::Live(TruncatedVec::new(
                        live.into_iter(),
                        constants::leaderboard::DISPLAY_LIMIT,
                        count,
                    )),
                    None,
                )
            }
        };

        GameSnapshot {
            phase: self.round.phase,
            round_number: self.round.number,
            time_remaining: self.round.time_remaining,
            player_count: self.players.len(),
            leaderboard,
            winner,
            all_time: self.records.top(),
        }
    }

    /// Pushes the current snapshot to every connected console
    fn broadcast<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) {
        self.watchers
            .announce(&UpdateMessage::Snapshot(self.snapshot()).into(), tunnel_finder);
    }

    /// Registers a new, not-yet-joined connection
    ///
    /// The connection receives a full state sync immediately so its screen
    /// is correct while the user decides whether to join.
    ///
    /// # Errors
    ///
    /// Returns [`watcher::Error`] if the process-wide connection ceiling
    /// was reached.
    pub fn add_unassigned<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: Id,
        tunnel_finder: F,
    ) -> Result<(), watcher::Error> {
        self.watchers.add_watcher(watcher_id, Value::Unassigned)?;
        self.sync(watcher_id, tunnel_finder);
        Ok(())
    }

    /// Registers a host or display console
    ///
    /// # Errors
    ///
    /// Returns [`watcher::Error`] if the process-wide connection ceiling
    /// was reached.
    pub fn add_console<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: Id,
        value: Value,
        tunnel_finder: F,
    ) -> Result<(), watcher::Error> {
        self.watchers.add_watcher(watcher_id, value)?;
        self.sync(watcher_id, tunnel_finder);
        Ok(())
    }

    /// Sends a full state synchronization to one connection
    pub fn sync<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, watcher_id: Id, tunnel_finder: F) {
        self.watchers.send_state(
            &SyncMessage::Snapshot(self.snapshot()).into(),
            watcher_id,
            tunnel_finder,
        );
    }

    /// Handles an inbound message from a console
    ///
    /// Messages whose tag does not match the sender's registered role are
    /// dropped. Click accept/reject decisions are made synchronously
    /// against state current at processing time.
    pub fn receive_message<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(crate::AlarmMessage, Duration),
        P: RecordStore,
    >(
        &mut self,
        watcher_id: Id,
        message: IncomingMessage,
        mut schedule_message: S,
        tunnel_finder: F,
        record_store: &P,
    ) {
        let Some(watcher_value) = self.watchers.get_watcher_value(watcher_id) else {
            return;
        };

        if !message.follows(watcher_value.kind()) {
            return;
        }

        match message {
            IncomingMessage::Unassigned(IncomingUnassignedMessage::Join { name, ad_message }) => {
                self.handle_join(
                    watcher_id,
                    &name,
                    &ad_message,
                    &mut schedule_message,
                    &tunnel_finder,
                );
            }
            IncomingMessage::Unassigned(IncomingUnassignedMessage::Reconnect { token }) => {
                self.handle_reconnect(watcher_id, &token, &tunnel_finder);
            }
            IncomingMessage::Player(IncomingPlayerMessage::Click) => {
                self.handle_click(watcher_id, &tunnel_finder);
            }
            IncomingMessage::Host(IncomingHostMessage::Start(overrides)) => {
                if self.round.phase.round_in_progress() {
                    self.watchers.send_message(
                        &UpdateMessage::HostRejected(HostError::RoundInProgress).into(),
                        watcher_id,
                        &tunnel_finder,
                    );
                } else {
                    self.start_round(overrides, &mut schedule_message, &tunnel_finder);
                }
            }
            IncomingMessage::Host(IncomingHostMessage::OpenLobby) => {
                if self.round.phase == Phase::Finished {
                    self.return_to_lobby(&tunnel_finder);
                }
            }
            IncomingMessage::Host(IncomingHostMessage::Reset) => {
                self.return_to_lobby(&tunnel_finder);
            }
            IncomingMessage::Host(IncomingHostMessage::ResetStats) => {
                self.records.reset();
                self.records.persist(record_store);
                self.broadcast(&tunnel_finder);
            }
        }
    }

    /// Handles a scheduled alarm
    ///
    /// Stale round ticks (wrong round number or phase) are discarded, which
    /// is what makes "cancel before arm" structural rather than imperative.
    pub fn receive_alarm<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(crate::AlarmMessage, Duration),
        P: RecordStore,
    >(
        &mut self,
        message: crate::AlarmMessage,
        mut schedule_message: S,
        tunnel_finder: F,
        record_store: &P,
    ) {
        match message {
            crate::AlarmMessage::Game(AlarmMessage::Tick {
                round_number,
                phase,
            }) => {
                if round_number != self.round.number || phase != self.round.phase {
                    return;
                }
                self.handle_tick(&mut schedule_message, &tunnel_finder, record_store);
            }
            crate::AlarmMessage::Session(reconnect::AlarmMessage::Expiry { token }) => {
                let now = SystemTime::now();
                if let Some(snapshot) = self.sessions.expire_if_due(&token, now) {
                    self.names.release_name(&snapshot.name);
                }
            }
            crate::AlarmMessage::Session(reconnect::AlarmMessage::Sweep) => {
                let now = SystemTime::now();
                for snapshot in self.sessions.sweep(now) {
                    self.names.release_name(&snapshot.name);
                }
                schedule_message(
                    reconnect::AlarmMessage::Sweep.into(),
                    Duration::from_secs(constants::session::SWEEP_INTERVAL_SECONDS),
                );
            }
        }
    }

    /// Handles a transport-level disconnect notification
    ///
    /// The player entry leaves the live table immediately so leaderboards
    /// and counts reflect only truly-connected players; the session keeps
    /// the snapshot reclaimable for the grace period.
    pub fn handle_disconnect<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(crate::AlarmMessage, Duration),
    >(
        &mut self,
        watcher_id: Id,
        mut schedule_message: S,
        tunnel_finder: F,
    ) {
        self.rate_limiter.forget(watcher_id);
        self.anomaly.forget(watcher_id);

        if let Some(player) = self.players.remove(&watcher_id) {
            let now = SystemTime::now();
            self.names.detach(watcher_id);
            if let Some(token) = self.sessions.mark_disconnected(watcher_id, player, now) {
                schedule_message(
                    reconnect::AlarmMessage::Expiry { token }.into(),
                    Duration::from_secs(constants::session::GRACE_PERIOD_SECONDS),
                );
                self.ensure_sweep_armed(&mut schedule_message);
            }
            self.watchers.remove_watcher(watcher_id);
            self.broadcast(&tunnel_finder);
        } else {
            self.watchers.remove_watcher(watcher_id);
        }
    }

    /// Arms the recurring session sweep, once
    fn ensure_sweep_armed<S: FnMut(crate::AlarmMessage, Duration)>(
        &mut self,
        schedule_message: &mut S,
    ) {
        if !self.sweep_armed {
            self.sweep_armed = true;
            schedule_message(
                reconnect::AlarmMessage::Sweep.into(),
                Duration::from_secs(constants::session::SWEEP_INTERVAL_SECONDS),
            );
        }
    }

    /// Processes a join request from an unassigned connection
    fn handle_join<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(crate::AlarmMessage, Duration)>(
        &mut self,
        watcher_id: Id,
        name: &str,
        ad_message: &str,
        schedule_message: &mut S,
        tunnel_finder: &F,
    ) {
        if self.round.phase == Phase::Finished {
            self.watchers.send_message(
                &UpdateMessage::JoinRejected(JoinError::RoundOver).into(),
                watcher_id,
                tunnel_finder,
            );
            return;
        }

        if self.players.len() >= self.options.max_players {
            self.watchers.send_message(
                &UpdateMessage::JoinRejected(JoinError::Full).into(),
                watcher_id,
                tunnel_finder,
            );
            return;
        }

        let now = SystemTime::now();
        let name = self.names.resolve(watcher_id, name);
        let join_order = self.join_counter;
        self.join_counter += 1;

        let player = Player::new(
            watcher_id,
            name.clone(),
            player::color_for_join(join_order),
            sanitize_ad_message(ad_message),
            join_order,
        );

        let token = self.sessions.create(watcher_id, player.clone(), now);
        self.players.insert(watcher_id, player.clone());
        self.watchers.update_watcher_value(
            watcher_id,
            Value::Player(PlayerValue { name: name.clone() }),
        );

        self.ensure_sweep_armed(schedule_message);

        self.watchers.send_message(
            &reconnect::UpdateMessage::Welcome {
                token,
                name,
                color: player.color,
            }
            .into(),
            watcher_id,
            tunnel_finder,
        );

        self.broadcast(tunnel_finder);
    }

    /// Processes a reconnection attempt from an unassigned connection
    fn handle_reconnect<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: Id,
        token: &str,
        tunnel_finder: &F,
    ) {
        let now = SystemTime::now();
        match self
            .sessions
            .restore(&SessionToken::from(token), watcher_id, now)
        {
            Ok(snapshot) => {
                self.names.adopt(watcher_id, &snapshot.name);
                self.watchers.update_watcher_value(
                    watcher_id,
                    Value::Player(PlayerValue {
                        name: snapshot.name.clone(),
                    }),
                );

                self.watchers.send_message(
                    &reconnect::UpdateMessage::Welcome {
                        token: SessionToken::from(token),
                        name: snapshot.name.clone(),
                        color: snapshot.color.clone(),
                    }
                    .into(),
                    watcher_id,
                    tunnel_finder,
                );

                self.players.insert(watcher_id, snapshot);
                self.sync(watcher_id, tunnel_finder);
                self.broadcast(tunnel_finder);
            }
            Err(reason) => {
                self.watchers.send_message(
                    &reconnect::UpdateMessage::Denied(reason).into(),
                    watcher_id,
                    tunnel_finder,
                );
            }
        }
    }

    /// Processes a tap from a player connection
    ///
    /// Over-limit clicks are dropped silently with no state change and no
    /// error to the sender. Accepted clicks feed the anomaly detector and
    /// then take their phase-dependent effect; clicks outside an active
    /// window are no-ops.
    fn handle_click<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &mut self,
        watcher_id: Id,
        tunnel_finder: &F,
    ) {
        let now = SystemTime::now();

        if !self.rate_limiter.check_and_record(watcher_id, now) {
            return;
        }

        self.anomaly.record_click(watcher_id, now);
        let classification = self.anomaly.classify(watcher_id);

        let Some(player) = self.players.get_mut(&watcher_id) else {
            return;
        };

        if classification.suspicious {
            player.suspicious = classification.reason;
        }

        match self.round.phase {
            Phase::Stage1Active => {
                player.tap_count_stage1 += 1;
                self.broadcast(tunnel_finder);
            }
            Phase::Stage2Active => {
                if player.reaction_time_ms.is_none()
                    && let Some(opened_at) = self.round.stage2_opened_at
                    && let Ok(elapsed) = now.duration_since(opened_at)
                {
                    player.reaction_time_ms = Some(elapsed.as_millis() as u32);
                    self.broadcast(tunnel_finder);
                }
            }
            // Clicks in every other phase are ignored
            _ => {}
        }
    }

    /// Starts a new round
    ///
    /// Only reachable from `Lobby` or `Finished`; bumping the round number
    /// invalidates every tick still in flight from the previous round
    /// before the new countdown is armed.
    fn start_round<T: Tunnel, F: Fn(Id) -> Option<T>, S: FnMut(crate::AlarmMessage, Duration)>(
        &mut self,
        overrides: SettingsOverrides,
        schedule_message: &mut S,
        tunnel_finder: &F,
    ) {
        for player in self.players.values_mut() {
            player.reset_round_state();
        }
        self.sessions.reset_round_state();

        self.round = Round {
            phase: Phase::Stage1Countdown,
            number: self.round.number + 1,
            settings: RoundSettings::clamped(overrides),
            time_remaining: 0,
            stage2_opened_at: None,
            final_board: once_cell_serde::sync::OnceCell::new(),
        };
        self.round.time_remaining = self.round.settings.phase_seconds(Phase::Stage1Countdown);

        log::debug!(
            "round {} started: {:?}",
            self.round.number,
            self.round.settings
        );

        self.arm_tick(schedule_message);
        self.broadcast(tunnel_finder);
    }

    /// Forces an immediate return to the lobby
    ///
    /// All per-round counters go back to zero; outstanding ticks become
    /// stale via the phase change.
    fn return_to_lobby<T: Tunnel, F: Fn(Id) -> Option<T>>(&mut self, tunnel_finder: &F) {
        for player in self.players.values_mut() {
            player.reset_round_state();
        }
        self.sessions.reset_round_state();

        self.round.phase = Phase::Lobby;
        self.round.time_remaining = 0;
        self.round.stage2_opened_at = None;
        self.round.final_board = once_cell_serde::sync::OnceCell::new();

        self.broadcast(tunnel_finder);
    }

    /// Schedules the next one-second tick for the current phase
    fn arm_tick<S: FnMut(crate::AlarmMessage, Duration)>(&self, schedule_message: &mut S) {
        schedule_message(
            AlarmMessage::Tick {
                round_number: self.round.number,
                phase: self.round.phase,
            }
            .into(),
            Duration::from_secs(1),
        );
    }

    /// Handles an accepted (non-stale) countdown tick
    fn handle_tick<
        T: Tunnel,
        F: Fn(Id) -> Option<T>,
        S: FnMut(crate::AlarmMessage, Duration),
        P: RecordStore,
    >(
        &mut self,
        schedule_message: &mut S,
        tunnel_finder: &F,
        record_store: &P,
    ) {
        self.round.time_remaining = self.round.time_remaining.saturating_sub(1);

        if self.round.time_remaining > 0 {
            self.arm_tick(schedule_message);
        } else {
            self.advance_phase(schedule_message, record_store);
        }

        self.broadcast(tunnel_finder);
    }

    /// Moves the round to the next phase when a countdown hits zero
    fn advance_phase<S: FnMut(crate::AlarmMessage, Duration), P: RecordStore>(
        &mut self,
        schedule_message: &mut S,
        record_store: &P,
    ) {
        let next = match self.round.phase {
            Phase::Stage1Countdown => Phase::Stage1Active,
            Phase::Stage1Active => Phase::Stage2Countdown,
            Phase::Stage2Countdown => Phase::Stage2Active,
            Phase::Stage2Active => Phase::Finished,
            // Lobby and Finished are not timer-driven
            phase => phase,
        };

        self.round.phase = next;
        self.round.time_remaining = self.round.settings.phase_seconds(next);

        match next {
            Phase::Stage2Active => {
                self.round.stage2_opened_at = Some(SystemTime::now());
                self.arm_tick(schedule_message);
            }
            Phase::Finished => {
                self.finish_round(record_store);
            }
            Phase::Stage1Active | Phase::Stage2Countdown => {
                self.arm_tick(schedule_message);
            }
            Phase::Lobby | Phase::Stage1Countdown => {}
        }
    }

    /// Freezes the final leaderboard and applies the round to the records
    ///
    /// The frozen snapshot is computed from the live player table before
    /// any further disconnect can alter it, and is never recomputed.
    fn finish_round<P: RecordStore>(&mut self, record_store: &P) {
        let frozen = self
            .round
            .final_board
            .get_or_init(|| leaderboard::freeze(self.players.values()))
            .clone();

        log::debug!(
            "round {} finished, winner: {:?}",
            self.round.number,
            frozen.winner.as_ref().map(|w| w.name.as_str())
        );

        let now = SystemTime::now();
        self.records.apply_round(&frozen, now);
        self.records.persist(record_store);
    }
}
