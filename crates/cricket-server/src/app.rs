// Application state and the event loop that owns every room write.
//
// Client commands arrive through one mpsc channel and timer ticks through one
// interval, so all room mutations run on this task one at a time. Each write
// is still a versioned compare-and-swap, which keeps a second server process
// sharing the database from clobbering this one.

use std::collections::HashMap;
use std::time::Duration;

use cricket_core::auction;
use cricket_core::bidding;
use cricket_core::coordinator;
use cricket_core::db::{Database, StoreError, StoredRoom};
use cricket_core::error::{AuctionError, AuctionResult};
use cricket_core::layout;
use cricket_core::room::{Room, RoomCode, RoomUpdate};
use cricket_core::rules::AuctionRules;
use cricket_core::sets;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{ClientMessage, RoomSnapshot, ServerMessage};
use crate::ws_server::{ConnId, WsEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Audit lines included in each snapshot.
pub const SNAPSHOT_LOG_LINES: usize = 50;

const ROOM_CODE_ATTEMPTS: usize = 32;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Epoch-millisecond clock anchored once at startup and advanced by tokio's
/// monotonic clock, so paused-time tests drive deadlines too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_ms: i64,
    started: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn starting_at(epoch_ms: i64) -> Self {
        Clock {
            epoch_ms,
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.epoch_ms + self.started.elapsed().as_millis() as i64
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Connection {
    pub addr: String,
    pub outbound: mpsc::Sender<String>,
    pub uid: Option<String>,
    /// Room this client is looking at; snapshots for it are pushed here.
    pub room: Option<RoomCode>,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: Config,
    pub rules: AuctionRules,
    pub db: Database,
    pub connections: HashMap<ConnId, Connection>,
    pub clock: Clock,
    rng: StdRng,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Self {
        let rules = config.rules();
        AppState {
            config,
            rules,
            db,
            connections: HashMap::new(),
            clock: Clock::start(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the shuffle/room-code RNG (seeded in tests).
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    pub fn handle_ws_event(&mut self, event: WsEvent) {
        match event {
            WsEvent::Connected {
                conn_id,
                addr,
                outbound,
            } => {
                debug!("Registering client {conn_id} ({addr})");
                self.connections.insert(
                    conn_id,
                    Connection {
                        addr,
                        outbound,
                        uid: None,
                        room: None,
                    },
                );
            }
            WsEvent::Disconnected { conn_id } => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    debug!("Dropped client {conn_id} ({})", conn.addr);
                }
            }
            WsEvent::Message { conn_id, text } => {
                let now = self.clock.now_ms();
                self.handle_message(conn_id, &text, now);
            }
        }
    }

    /// Parse and execute one client frame. Failures go back to the sender
    /// as `ACTION_REJECTED`.
    pub fn handle_message(&mut self, conn_id: ConnId, text: &str, now: i64) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse message from client {conn_id}: {e}");
                self.reject(conn_id, &AuctionError::rejected(format!("malformed message: {e}")));
                return;
            }
        };

        if let Err(err) = self.dispatch(conn_id, msg, now) {
            match &err {
                AuctionError::Store(e) => error!("Store failure for client {conn_id}: {e:#}"),
                other => debug!("Client {conn_id} action refused: {other}"),
            }
            self.reject(conn_id, &err);
        }
    }

    fn dispatch(&mut self, conn_id: ConnId, msg: ClientMessage, now: i64) -> AuctionResult<()> {
        match msg {
            ClientMessage::Identify { uid } => self.identify(conn_id, uid),
            ClientMessage::CreateRoom { team_name } => self.create_room(conn_id, &team_name, now),
            ClientMessage::JoinRoom { room, team_name } => {
                self.join_room(conn_id, &room, &team_name, now)
            }
            ClientMessage::OpenRoom { room } => self.open_room(conn_id, &room, now),
            ClientMessage::UpdateConfig {
                season,
                cf1,
                cf2,
                cf3,
            } => self
                .as_member(conn_id, now, |room, uid, _, _| {
                    room.update_config(uid, season.as_deref(), cf1, cf2, cf3)
                })
                .map(drop),
            ClientMessage::GenerateSets => self.generate_sets(conn_id, now),
            ClientMessage::StartAuction => self
                .as_member(conn_id, now, auction::start_auction)
                .map(drop),
            ClientMessage::SkipPlayer => self
                .as_member(conn_id, now, auction::skip_player)
                .map(drop),
            ClientMessage::StartBid => self
                .as_team(conn_id, now, bidding::place_start_bid)
                .map(drop),
            ClientMessage::RaiseBid { increment_lakhs } => self
                .as_team(conn_id, now, |room, team, rules, now| {
                    bidding::raise_bid(room, team, increment_lakhs, rules, now)
                })
                .map(drop),
            ClientMessage::CustomBid { amount, unit } => self
                .as_team(conn_id, now, |room, team, rules, now| {
                    bidding::place_custom_bid(room, team, amount, unit, rules, now)
                })
                .map(drop),
            ClientMessage::SitOut => self
                .as_team(conn_id, now, |room, team, _, now| bidding::sit_out(room, team, now))
                .map(drop),
            ClientMessage::UseTimeBank => self
                .as_team(conn_id, now, bidding::use_time_bank)
                .map(drop),
            ClientMessage::AssignSlot {
                role,
                index,
                player_id,
            } => self
                .as_team(conn_id, now, |room, team, _, _| {
                    layout::assign_slot(room, team, role, index, &player_id)
                })
                .map(drop),
            ClientMessage::ClearSlot { role, index } => self
                .as_team(conn_id, now, |room, team, _, _| {
                    layout::clear_slot(room, team, role, index)
                })
                .map(drop),
            ClientMessage::FinalizeLayout => {
                let stored = self.as_team(conn_id, now, |room, team, _, _| {
                    layout::finalize_layout(room, team)
                })?;
                if layout::all_finalized(&stored.room) {
                    self.publish_leaderboard(&stored.room)?;
                }
                Ok(())
            }
            ClientMessage::GetLeaderboard => {
                let (code, _) = self.context_of(conn_id)?;
                let stored = self.load(&code)?;
                let message = self.leaderboard_message(&stored.room)?;
                self.send(conn_id, &message);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity and room membership
    // ------------------------------------------------------------------

    fn connection_mut(&mut self, conn_id: ConnId) -> AuctionResult<&mut Connection> {
        self.connections
            .get_mut(&conn_id)
            .ok_or_else(|| AuctionError::not_found(format!("connection {conn_id}")))
    }

    fn uid_of(&self, conn_id: ConnId) -> AuctionResult<String> {
        self.connections
            .get(&conn_id)
            .and_then(|c| c.uid.clone())
            .ok_or_else(|| AuctionError::rejected("identify before sending commands"))
    }

    /// The room this connection is in, plus its identity.
    fn context_of(&self, conn_id: ConnId) -> AuctionResult<(RoomCode, String)> {
        let uid = self.uid_of(conn_id)?;
        let code = self
            .connections
            .get(&conn_id)
            .and_then(|c| c.room.clone())
            .ok_or_else(|| AuctionError::rejected("open a room first"))?;
        Ok((code, uid))
    }

    fn identify(&mut self, conn_id: ConnId, uid: Option<String>) -> AuctionResult<()> {
        let uid = uid
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.connection_mut(conn_id)?.uid = Some(uid.clone());
        debug!("Client {conn_id} identified as {uid}");
        self.send(conn_id, &ServerMessage::Identified { uid });
        Ok(())
    }

    fn create_room(&mut self, conn_id: ConnId, team_name: &str, now: i64) -> AuctionResult<()> {
        let uid = self.uid_of(conn_id)?;

        let mut code = None;
        for _ in 0..ROOM_CODE_ATTEMPTS {
            let candidate = RoomCode::generate(&mut self.rng);
            if !self.db.room_exists(&candidate)? {
                code = Some(candidate);
                break;
            }
        }
        let code = code.ok_or_else(|| {
            AuctionError::Store(anyhow::anyhow!("could not find an unused room code"))
        })?;

        let room = Room::new(code.clone(), now, self.config.room_defaults());
        let (team_id, joined) = room.join(&uid, team_name, &self.rules, new_team_id())?;
        let mut log = vec![format!("Room {code} created")];
        let room = match joined {
            Some(update) => {
                log.extend(update.log);
                update.room
            }
            None => room,
        };

        self.db.insert_room(&room)?;
        self.append_logs(&code, now, &log);
        self.remember_session(&code, &uid, &team_id);
        info!("Room {code} created by {uid}");

        self.connection_mut(conn_id)?.room = Some(code.clone());
        self.broadcast(&code, now);
        Ok(())
    }

    fn join_room(
        &mut self,
        conn_id: ConnId,
        raw_code: &str,
        team_name: &str,
        now: i64,
    ) -> AuctionResult<()> {
        let uid = self.uid_of(conn_id)?;
        let code = parse_code(raw_code)?;
        let stored = self.load(&code)?;

        let (team_id, joined) = stored.room.join(&uid, team_name, &self.rules, new_team_id())?;
        if let Some(update) = joined {
            self.commit(&code, stored.version, update, now)?;
        }
        self.remember_session(&code, &uid, &team_id);

        self.connection_mut(conn_id)?.room = Some(code.clone());
        self.broadcast(&code, now);
        Ok(())
    }

    fn open_room(&mut self, conn_id: ConnId, raw_code: &str, now: i64) -> AuctionResult<()> {
        self.uid_of(conn_id)?;
        let code = parse_code(raw_code)?;
        let stored = self.load(&code)?;
        self.connection_mut(conn_id)?.room = Some(code.clone());
        self.send_snapshot(conn_id, &stored.room, now);
        Ok(())
    }

    /// Team id for `uid` in this room: the stored session if it still points
    /// at a team this identity owns, else the team it owns.
    pub fn resolve_session(&self, room: &Room, uid: &str) -> Option<String> {
        match self.db.load_session(&room.code, uid) {
            Ok(Some(team_id))
                if room
                    .teams
                    .get(&team_id)
                    .is_some_and(|t| t.owner_uid == uid) =>
            {
                return Some(team_id);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load session for {uid} in room {}: {e:#}", room.code),
        }
        room.team_for_uid(uid).map(|t| t.id.clone())
    }

    fn remember_session(&self, code: &RoomCode, uid: &str, team_id: &str) {
        if let Err(e) = self.db.save_session(code, uid, team_id) {
            warn!("Failed to save session for {uid} in room {code}: {e:#}");
        }
    }

    // ------------------------------------------------------------------
    // Mutation pipeline
    // ------------------------------------------------------------------

    fn load(&self, code: &RoomCode) -> AuctionResult<StoredRoom> {
        self.db
            .load_room(code)?
            .ok_or_else(|| AuctionError::not_found(format!("room {code}")))
    }

    /// Conditional write plus best-effort audit lines.
    fn commit(
        &mut self,
        code: &RoomCode,
        expected_version: i64,
        update: RoomUpdate,
        now: i64,
    ) -> AuctionResult<StoredRoom> {
        let version = self.db.commit_room(&update.room, expected_version)?;
        self.append_logs(code, now, &update.log);
        Ok(StoredRoom {
            room: update.room,
            version,
        })
    }

    fn append_logs(&self, code: &RoomCode, now: i64, lines: &[String]) {
        for line in lines {
            if let Err(e) = self.db.append_log(code, now, line) {
                warn!("Failed to append log for room {code}: {e:#}");
            }
        }
    }

    /// Apply any timer transition that is already due on `stored`.
    fn settle_if_due(&mut self, stored: StoredRoom, now: i64) -> AuctionResult<StoredRoom> {
        match coordinator::tick(&stored.room, &self.rules, now)? {
            Some(update) => {
                let code = stored.room.code.clone();
                self.commit(&code, stored.version, update, now)
            }
            None => Ok(stored),
        }
    }

    /// Commit a computed update, fire an immediate settlement if the write
    /// left a sole bidder or nobody able to bid, then push snapshots.
    fn finish_mutation(
        &mut self,
        code: &RoomCode,
        expected_version: i64,
        update: RoomUpdate,
        now: i64,
    ) -> AuctionResult<StoredRoom> {
        let stored = self.commit(code, expected_version, update, now)?;
        let stored = self.settle_if_due(stored, now)?;
        self.broadcast(code, now);
        Ok(stored)
    }

    /// Run `op` with the caller's uid against the caller's room.
    fn as_member<F>(&mut self, conn_id: ConnId, now: i64, op: F) -> AuctionResult<StoredRoom>
    where
        F: FnOnce(&Room, &str, &AuctionRules, i64) -> AuctionResult<RoomUpdate>,
    {
        let (code, uid) = self.context_of(conn_id)?;
        let stored = self.load(&code)?;
        let update = op(&stored.room, &uid, &self.rules, now)?;
        self.finish_mutation(&code, stored.version, update, now)
    }

    /// Run `op` with the caller's team id against the caller's room.
    fn as_team<F>(&mut self, conn_id: ConnId, now: i64, op: F) -> AuctionResult<StoredRoom>
    where
        F: FnOnce(&Room, &str, &AuctionRules, i64) -> AuctionResult<RoomUpdate>,
    {
        let (code, uid) = self.context_of(conn_id)?;
        let stored = self.load(&code)?;
        let team_id = self
            .resolve_session(&stored.room, &uid)
            .ok_or_else(|| AuctionError::not_found(format!("your team in room {code}")))?;
        let update = op(&stored.room, &team_id, &self.rules, now)?;
        self.finish_mutation(&code, stored.version, update, now)
    }

    fn generate_sets(&mut self, conn_id: ConnId, now: i64) -> AuctionResult<()> {
        let (code, uid) = self.context_of(conn_id)?;
        let stored = self.load(&code)?;
        let season = self.db.load_season(&stored.room.config.season)?;
        let update = sets::generate_sets(&stored.room, &uid, &season, &mut self.rng)?;
        self.finish_mutation(&code, stored.version, update, now)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// One coordinator pass over every room with a live auction.
    pub fn run_scheduler(&mut self, now: i64) {
        let codes = match self.db.live_room_codes() {
            Ok(codes) => codes,
            Err(e) => {
                error!("Failed to list live rooms: {e:#}");
                return;
            }
        };
        for code in codes {
            match self.tick_room(&code, now) {
                Ok(true) => self.broadcast(&code, now),
                Ok(false) => {}
                Err(e) => warn!("Tick for room {code} failed: {e}"),
            }
        }
    }

    fn tick_room(&mut self, code: &RoomCode, now: i64) -> AuctionResult<bool> {
        let stored = self.load(code)?;
        let before = stored.version;
        let after = self.settle_if_due(stored, now)?;
        Ok(after.version != before)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send(&self, conn_id: ConnId, message: &ServerMessage) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message for client {conn_id}: {e}");
                return;
            }
        };
        match conn.outbound.try_send(json) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Client {conn_id} is not keeping up; dropping a frame")
            }
            Err(TrySendError::Closed(_)) => debug!("Client {conn_id} outbound closed"),
        }
    }

    fn reject(&self, conn_id: ConnId, err: &AuctionError) {
        let reason = match err {
            AuctionError::Store(e) if e.downcast_ref::<StoreError>().is_some() => {
                "the room changed while your action was processed; please retry".to_string()
            }
            AuctionError::Store(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        self.send(
            conn_id,
            &ServerMessage::ActionRejected {
                kind: err.kind().to_string(),
                reason,
            },
        );
    }

    fn snapshot_for(&self, conn_id: ConnId, room: &Room, now: i64) -> RoomSnapshot {
        let uid = self.connections.get(&conn_id).and_then(|c| c.uid.as_deref());
        let logs = self
            .db
            .load_logs(&room.code, SNAPSHOT_LOG_LINES)
            .unwrap_or_else(|e| {
                warn!("Failed to load logs for room {}: {e:#}", room.code);
                Vec::new()
            });
        RoomSnapshot {
            room: room.code.display_code(),
            your_team_id: uid.and_then(|uid| self.resolve_session(room, uid)),
            is_admin: uid.is_some_and(|uid| room.is_admin(uid)),
            server_time: now,
            state: room.clone(),
            logs,
        }
    }

    fn send_snapshot(&self, conn_id: ConnId, room: &Room, now: i64) {
        let snapshot = self.snapshot_for(conn_id, room, now);
        self.send(conn_id, &ServerMessage::RoomSnapshot(snapshot));
    }

    /// Push the committed state of `code` to everyone watching it.
    fn broadcast(&self, code: &RoomCode, now: i64) {
        let room = match self.db.load_room(code) {
            Ok(Some(stored)) => stored.room,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to reload room {code} for broadcast: {e:#}");
                return;
            }
        };
        for conn_id in self.watchers(code) {
            self.send_snapshot(conn_id, &room, now);
        }
    }

    fn watchers(&self, code: &RoomCode) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.room.as_ref() == Some(code))
            .map(|(id, _)| *id)
            .collect()
    }

    fn leaderboard_message(&self, room: &Room) -> AuctionResult<ServerMessage> {
        let season = self.db.load_season(&room.config.season)?;
        let rows = layout::leaderboard(room, &season)?;
        Ok(ServerMessage::Leaderboard {
            room: room.code.display_code(),
            rows,
        })
    }

    fn publish_leaderboard(&self, room: &Room) -> AuctionResult<()> {
        let message = self.leaderboard_message(room)?;
        info!("Room {}: every squad finalized, leaderboard published", room.code);
        for conn_id in self.watchers(&room.code) {
            self.send(conn_id, &message);
        }
        Ok(())
    }
}

fn parse_code(raw: &str) -> AuctionResult<RoomCode> {
    RoomCode::parse(raw).ok_or_else(|| AuctionError::rejected("room code is required"))
}

fn new_team_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the application loop until shutdown is signalled or the WebSocket
/// side goes away.
///
/// A fixed-interval tick drives deadline settlement and result-window
/// advances between client events. Connected clients keep `ws_rx` open, so `shutdown` is the normal
/// way out; a dropped shutdown sender stops the loop as well.
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Application event loop started");

    let period = Duration::from_millis(state.config.auction.tick_interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            event = ws_rx.recv() => {
                match event {
                    Some(event) => state.handle_ws_event(event),
                    None => {
                        info!("WebSocket channel closed, shutting down");
                        break;
                    }
                }
            }

            _ = shutdown.changed() => {
                info!("Shutdown signalled, stopping event loop");
                break;
            }

            _ = ticker.tick() => {
                let now = state.clock.now_ms();
                state.run_scheduler(now);
            }
        }
    }

    info!("Application event loop exiting");
    Ok(())
}
