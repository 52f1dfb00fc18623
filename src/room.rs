//! Rooms: the protocol dispatcher and the authoritative state a connection
//! maintains (roster, message history, moderator map, ban tables and the
//! room announcement).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use rand::Rng;
use tracing::{debug, error};

use crate::connection::{Connection, FrameReader};
use crate::event::{Event, EventBus};
use crate::model::{
    anon_name, clean_message, escape_html, mention_candidates, message_cut, normalize_trailing,
    parse_font, Channel, Message, MessageFlags, ModeratorFlags, User, UserAttrs, UserRegistry,
};
use crate::server::get_server;
use crate::{rest, wire, Error, Result};

bitflags! {
    /// Room feature toggles delivered with `ok` and `groupflagsupdate`.
    pub struct RoomFlags: u32 {
        const LIST_TAXONOMY = 1 << 0;
        const NO_ANONS = 1 << 2;
        const NO_FLAGGING = 1 << 3;
        const NO_COUNTER = 1 << 4;
        const NO_IMAGES = 1 << 5;
        const NO_LINKS = 1 << 6;
        const NO_VIDEOS = 1 << 7;
        const NO_STYLED_TEXT = 1 << 8;
        const NO_LINKS_CHATANGO = 1 << 9;
        const NO_BROADCAST_MSG_WITH_BW = 1 << 10;
        const RATE_LIMIT_REGIMEON = 1 << 11;
        const CHANNELS_DISABLED = 1 << 13;
        const NLP_SINGLEMSG = 1 << 14;
        const NLP_MSGQUEUE = 1 << 15;
        const BROADCAST_MODE = 1 << 16;
        const CLOSED_IF_NO_MODS = 1 << 17;
        const IS_CLOSED = 1 << 18;
        const SHOW_MOD_ICONS = 1 << 19;
        const MODS_CHOOSE_VISIBILITY = 1 << 20;
        const NLP_NGRAM = 1 << 21;
        const NO_PROXIES = 1 << 22;
        const HAS_XML = 1 << 28;
        const UNSAFE = 1 << 29;
    }
}

/// One entry of the ban table.
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub unid: String,
    pub ip: String,
    pub target: User,
    pub time: f64,
    pub src: User,
}

/// Delay between reconnect attempts in `listen`.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Hard bound on the message history; eviction is from the front.
const HISTORY_CAP: usize = 2900;
/// Recent departures remembered for login/logout bookkeeping.
const USER_HISTORY_CAP: usize = 10;
/// Bound on the recent-unbans log.
const UNBAN_QUEUE_CAP: usize = 500;
/// Longest body the server accepts in one `bm`.
const MAX_MESSAGE_LEN: usize = 2700;

/// A Chatango room connection and its tracked state.
///
/// Constructing a room resolves its shard server but does not touch the
/// network; `listen` (or `connect`) does. State is mutated exclusively by
/// the frame handlers, in arrival order.
pub struct Room {
    name: String,
    server: String,
    uid: String,
    conn: Connection,
    events: EventBus,
    registry: Arc<UserRegistry>,

    pub(crate) reconnect: bool,
    connected_once: bool,
    silent: bool,
    bg_mode: u32,
    badge: u32,
    message_flags: u32,

    owner: Option<User>,
    self_user: Option<User>,
    puid: String,
    current_name: String,
    current_ip: String,
    time_correction: f64,
    flags: RoomFlags,
    user_count: u32,

    participants: HashMap<String, (String, User)>,
    participant_history: VecDeque<(String, User)>,
    mods: HashMap<User, ModeratorFlags>,

    history: VecDeque<Arc<Message>>,
    msgs: HashMap<String, Arc<Message>>,
    mqueue: HashMap<String, Message>,
    uqueue: HashMap<String, String>,
    no_more: bool,

    ban_list: HashMap<User, BanRecord>,
    unban_queue: VecDeque<BanRecord>,
    unbanned_words: Vec<String>,

    announcement: (u32, u32, String),
}

impl Room {
    /// Create a room bound to the global user registry.
    pub fn new(name: &str) -> Result<Room> {
        Room::with_registry(name, UserRegistry::global())
    }

    /// Create a room against a specific registry. Tests use this to keep
    /// their interned users away from everyone else's.
    pub fn with_registry(name: &str, registry: Arc<UserRegistry>) -> Result<Room> {
        Room::validate_name(name)?;
        Ok(Room {
            name: name.to_owned(),
            server: get_server(name),
            uid: gen_uid(),
            conn: Connection::new(),
            events: EventBus::new(),
            registry,
            reconnect: false,
            connected_once: false,
            silent: false,
            bg_mode: 0,
            badge: 0,
            message_flags: 0,
            owner: None,
            self_user: None,
            puid: String::new(),
            current_name: String::new(),
            current_ip: String::new(),
            time_correction: 0.0,
            flags: RoomFlags::empty(),
            user_count: 0,
            participants: HashMap::new(),
            participant_history: VecDeque::new(),
            mods: HashMap::new(),
            history: VecDeque::new(),
            msgs: HashMap::new(),
            mqueue: HashMap::new(),
            uqueue: HashMap::new(),
            no_more: false,
            ban_list: HashMap::new(),
            unban_queue: VecDeque::new(),
            unbanned_words: Vec::new(),
            announcement: (0, 0, String::new()),
        })
    }

    /// Check a room name against `^[a-z0-9-]{1,20}$`.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= 20
            && name
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidRoomName(name.to_owned()))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shard host resolved at construction.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Whether the server has acknowledged the session at least once.
    pub fn has_connected(&self) -> bool {
        self.connected_once
    }

    /// Subscribe to this room's events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub fn owner(&self) -> Option<User> {
        self.owner.clone()
    }

    /// The identity this connection is authenticated as, once `ok` arrived.
    pub fn user(&self) -> Option<User> {
        self.self_user.clone()
    }

    pub fn flags(&self) -> RoomFlags {
        self.flags
    }

    pub fn announcement(&self) -> (u32, u32, String) {
        self.announcement.clone()
    }

    /// Moderators and their power bits.
    pub fn mods(&self) -> HashMap<User, ModeratorFlags> {
        self.mods.clone()
    }

    /// Server-reported user count, or the roster size when the room runs
    /// without a counter.
    pub fn user_count(&self) -> u32 {
        if self.flags.contains(RoomFlags::NO_COUNTER) {
            self.all_user_list().len() as u32
        } else {
            self.user_count
        }
    }

    /// Named users currently in the room, deduplicated and sorted.
    pub fn user_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .participants
            .values()
            .filter(|(_, user)| !user.is_anon())
            .map(|(_, user)| user.clone())
            .collect();
        users.sort_by(|a, b| a.name().cmp(b.name()));
        users.dedup();
        users
    }

    /// Everyone in the room, anons included.
    pub fn all_user_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .participants
            .values()
            .map(|(_, user)| user.clone())
            .collect();
        users.sort_by(|a, b| a.name().cmp(b.name()));
        users.dedup();
        users
    }

    /// Anonymous users currently in the room.
    pub fn anon_list(&self) -> Vec<User> {
        self.all_user_list()
            .into_iter()
            .filter(|user| user.is_anon())
            .collect()
    }

    pub fn history(&self) -> &VecDeque<Arc<Message>> {
        &self.history
    }

    /// Look a message up by its final id.
    pub fn message_by_id(&self, id: &str) -> Option<Arc<Message>> {
        self.msgs.get(id).cloned()
    }

    /// Usernames currently banned.
    pub fn ban_list(&self) -> Vec<User> {
        self.ban_list.keys().cloned().collect()
    }

    /// The ban record for a user, if any.
    pub fn ban_record(&self, user: &User) -> Option<&BanRecord> {
        self.ban_list.get(user)
    }

    /// Users in the recent-unbans log.
    pub fn unban_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .unban_queue
            .iter()
            .map(|record| record.target.clone())
            .collect();
        users.sort_by(|a, b| a.name().cmp(b.name()));
        users.dedup();
        users
    }

    /// Suppress outbound messages without disconnecting.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// The word fragments most recently reported unbanned.
    pub fn unbanned_words(&self) -> &[String] {
        &self.unbanned_words
    }

    /// Extra flag bits attached to every outbound message.
    pub fn set_message_flags(&mut self, flags: u32) {
        self.message_flags = flags;
    }

    /// The last message seen, or the last message by `user`.
    pub fn get_last_message(&self, user: Option<&User>) -> Option<Arc<Message>> {
        match user {
            None => self.history.back().cloned(),
            Some(user) => self
                .history
                .iter()
                .rev()
                .find(|msg| msg.user == *user)
                .cloned(),
        }
    }

    /// Moderation level of a user: 3 owner, 2 admin, 1 moderator, 0 none.
    pub fn get_level(&self, user: &User) -> u8 {
        if self.owner.as_ref() == Some(user) {
            return 3;
        }
        match self.mods.get(user) {
            Some(flags) if flags.is_admin() => 2,
            Some(_) => 1,
            None => 0,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Dial the shard and authenticate. Fails synchronously when already
    /// connected; transport failures leave the room disconnected and are
    /// the listen loop's to deal with.
    pub async fn connect(&mut self, user_name: &str, password: &str) -> Result<FrameReader> {
        if self.conn.is_connected() {
            return Err(Error::AlreadyConnected(self.name.clone()));
        }
        let server = self.server.clone();
        let reader = self.conn.connect(&server, self.events.clone()).await?;
        self.conn
            .send(&["bauth", &self.name, &self.uid, user_name, password]);
        Ok(reader)
    }

    /// Join the room and stay on it: drive the receive loop, and when the
    /// connection drops, either return or sleep and redial depending on the
    /// `reconnect` flag.
    pub async fn listen(&mut self, user_name: &str, password: &str, reconnect: bool) -> Result<()> {
        self.reconnect = reconnect;
        loop {
            match self.connect(user_name, password).await {
                Ok(mut reader) => {
                    while let Some(frame) = reader.next().await {
                        self.handle_command(&frame);
                    }
                    self.handle_disconnect();
                }
                Err(err @ Error::AlreadyConnected(_)) => return Err(err),
                Err(err) => {
                    error!("could not connect to {}: {}", self.server, err);
                }
            }
            if !self.reconnect {
                return Ok(());
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Force this room to disconnect and stay down.
    pub fn disconnect(&mut self) {
        for user in self.user_list() {
            user.remove_session(&self.name, None);
        }
        self.reconnect = false;
        self.conn.disconnect();
    }

    /// Disconnect but let the listen loop dial again.
    pub fn bounce(&mut self) {
        self.conn.disconnect();
    }

    pub(crate) fn handle_disconnect(&mut self) {
        self.conn.disconnect();
        self.events.emit(Event::Disconnect {
            room: self.name.clone(),
        });
    }

    // ---- dispatcher ------------------------------------------------------

    /// Route one inbound frame to its verb handler. Unknown verbs and
    /// handler failures are logged and dropped; a bad frame never takes the
    /// connection down.
    ///
    /// The listen loop calls this for every received frame, strictly in
    /// arrival order. It is public so a frame stream can be driven without
    /// a live socket.
    pub fn handle_command(&mut self, frame: &str) {
        if frame.is_empty() {
            return;
        }
        let (verb, args) = wire::split_command(frame);
        let result = match verb {
            "ok" => self.rcmd_ok(&args),
            "inited" => self.rcmd_inited(&args),
            "pwdok" => self.rcmd_pwdok(&args),
            "annc" => self.rcmd_annc(&args),
            "pong" => self.rcmd_pong(&args),
            "nomore" => self.rcmd_nomore(&args),
            "n" => self.rcmd_n(&args),
            "i" => self.rcmd_i(&args),
            "b" => self.rcmd_b(&args),
            "u" => self.rcmd_u(&args),
            "premium" => self.rcmd_premium(&args),
            "show_fw" => self.rcmd_show_fw(&args),
            "g_participants" => self.rcmd_g_participants(&args),
            "gparticipants" => self.rcmd_gparticipants(&args),
            "participant" => self.rcmd_participant(&args),
            "mods" => self.rcmd_mods(&args),
            "groupflagsupdate" => self.rcmd_groupflagsupdate(&args),
            "blocked" => self.rcmd_blocked(&args),
            "blocklist" => self.rcmd_blocklist(&args),
            "unblocked" => self.rcmd_unblocked(&args),
            "unblocklist" => self.rcmd_unblocklist(&args),
            "clearall" => self.rcmd_clearall(&args),
            "denied" => self.rcmd_denied(&args),
            "updatemoderr" => self.rcmd_updatemoderr(&args),
            "proxybanned" => self.rcmd_proxybanned(&args),
            "show_tb" => self.rcmd_show_tb(&args),
            "tb" => self.rcmd_tb(&args),
            "miu" => self.rcmd_miu(&args),
            "delete" => self.rcmd_delete(&args),
            "deleteall" => self.rcmd_deleteall(&args),
            "bw" => self.rcmd_bw(&args),
            "ubw" => self.rcmd_ubw(&args),
            "getannc" => self.rcmd_getannc(&args),
            "getratelimit" => self.rcmd_getratelimit(&args),
            "msglexceeded" => self.rcmd_msglexceeded(&args),
            "climited" => self.rcmd_climited(&args),
            "show_nlp" => self.rcmd_show_nlp(&args),
            "nlptb" => self.rcmd_nlptb(&args),
            "logoutfirst" => self.rcmd_logoutfirst(&args),
            "logoutok" => self.rcmd_logoutok(&args),
            "updateprofile" => self.rcmd_updateprofile(&args),
            "reload_profile" => self.rcmd_reload_profile(&args),
            _ => {
                debug!("unhandled command `{}`", verb);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!("error while handling command `{}`: {}", verb, err);
        }
    }

    // ---- session handlers ------------------------------------------------

    fn rcmd_ok(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 8 {
            return Err(Error::Malformed("ok frame"));
        }
        self.owner = Some(self.registry.intern(args[0]));
        self.puid = args[1].to_owned();
        let login_mode = args[2];
        self.current_name = args[3].to_owned();
        let connection_time: f64 = args[4]
            .parse()
            .map_err(|_| Error::Malformed("ok connection time"))?;
        self.time_correction = connection_time - unix_now();
        self.current_ip = args[5].to_owned();
        self.flags = RoomFlags::from_bits_truncate(
            args[7].parse().map_err(|_| Error::Malformed("ok flags"))?,
        );

        self.mods.clear();
        for entry in args[6].split(';') {
            if let Some((name, power)) = entry.split_once(',') {
                let flags = ModeratorFlags::from_bits_truncate(power.parse().unwrap_or(0));
                self.mods.insert(self.registry.intern(name), flags);
            }
        }

        match login_mode {
            "C" => {
                let user = self.anon_self_user();
                self.self_user = Some(user);
            }
            "M" => {
                self.self_user = Some(self.registry.intern_with(
                    &self.current_name.clone(),
                    UserAttrs {
                        is_anon: Some(false),
                        puid: Some(self.puid.clone()),
                        ip: Some(self.current_ip.clone()),
                    },
                ));
            }
            _ => {}
        }

        self.connected_once = true;
        self.events.emit(Event::Connect {
            room: self.name.clone(),
        });
        Ok(())
    }

    /// The anon identity derived from this session's clock correction.
    fn anon_self_user(&self) -> User {
        let digits = format!("{}", self.time_correction.trunc() as i64);
        let tail: String = digits
            .chars()
            .skip(digits.chars().count().saturating_sub(4))
            .filter(|&ch| ch != '-')
            .collect();
        let name = anon_name(&tail, &self.puid);
        self.registry.intern_with(
            &name,
            UserAttrs {
                is_anon: Some(true),
                puid: Some(self.puid.clone()),
                ip: Some(self.current_ip.clone()),
            },
        )
    }

    fn rcmd_inited(&mut self, _args: &[&str]) -> Result<()> {
        self.reload();
        Ok(())
    }

    /// The post-`inited` refresh: roster, premium, announcement, banned
    /// words, rate limit, ban and unban lists, then styles when premium.
    fn reload(&mut self) {
        if self.user_count <= 1000 {
            self.conn.send(&["g_participants", "start"]);
        } else {
            self.conn.send(&["gparticipants", "start"]);
        }
        self.conn.send(&["getpremium", "l"]);
        self.conn.send(&["getannouncement"]);
        self.conn.send(&["getbannedwords"]);
        self.conn.send(&["getratelimit"]);
        self.request_banlist();
        self.request_unbanlist();
        if let Some(user) = self.self_user.clone() {
            if user.is_premium() == Some(true) {
                self.style_init(&user);
            }
        }
    }

    fn style_init(&mut self, user: &User) {
        if user.is_anon() {
            self.set_font(Some("000000"), Some("000000"), Some(11), Some("1"));
            return;
        }
        if user.is_premium() == Some(true) {
            let styled = user.clone();
            tokio::spawn(async move {
                if let Err(err) = rest::fetch_styles(&styled).await {
                    debug!("style fetch for {} failed: {}", styled.name(), err);
                }
            });
        }
        let profiled = user.clone();
        tokio::spawn(async move {
            if let Err(err) = rest::fetch_profile(&profiled).await {
                debug!("profile fetch for {} failed: {}", profiled.name(), err);
            }
        });
    }

    fn rcmd_pwdok(&mut self, _args: &[&str]) -> Result<()> {
        if let Some(user) = self.self_user.clone() {
            user.set_anon(false);
            self.conn.send(&["getpremium", "l"]);
            self.style_init(&user);
        }
        Ok(())
    }

    fn rcmd_pong(&mut self, _args: &[&str]) -> Result<()> {
        self.events.emit(Event::Pong);
        Ok(())
    }

    fn rcmd_nomore(&mut self, _args: &[&str]) -> Result<()> {
        self.no_more = true;
        Ok(())
    }

    fn rcmd_n(&mut self, args: &[&str]) -> Result<()> {
        let hex = args.first().ok_or(Error::Malformed("n frame"))?;
        self.user_count =
            u32::from_str_radix(hex, 16).map_err(|_| Error::Malformed("n count"))?;
        Ok(())
    }

    // ---- messages --------------------------------------------------------

    fn rcmd_b(&mut self, args: &[&str]) -> Result<()> {
        let msg = self.parse_message(args)?;
        let temp_id = msg.temp_id.clone();
        if let Some(final_id) = self.uqueue.remove(&temp_id) {
            let mut msg = msg;
            msg.id = Some(final_id);
            let msg = Arc::new(msg);
            self.add_history(msg.clone());
            self.events.emit(Event::Message(msg));
        } else {
            self.mqueue.insert(temp_id, msg);
        }
        Ok(())
    }

    fn rcmd_u(&mut self, args: &[&str]) -> Result<()> {
        let temp_id = *args.first().ok_or(Error::Malformed("u frame"))?;
        let final_id = *args.get(1).ok_or(Error::Malformed("u frame"))?;
        if let Some(mut msg) = self.mqueue.remove(temp_id) {
            msg.id = Some(final_id.to_owned());
            let msg = Arc::new(msg);
            self.add_history(msg.clone());
            self.events.emit(Event::Message(msg));
        } else {
            self.uqueue.insert(temp_id.to_owned(), final_id.to_owned());
        }
        Ok(())
    }

    /// Historical backfill; these already carry their final id and go in
    /// front of the live history, up to capacity.
    fn rcmd_i(&mut self, args: &[&str]) -> Result<()> {
        let mut msg = self.parse_message(args)?;
        msg.id = Some(msg.temp_id.clone());
        if self.history.len() < HISTORY_CAP {
            let msg = Arc::new(msg);
            if let Some(ref id) = msg.id {
                self.msgs.insert(id.clone(), msg.clone());
            }
            self.history.push_front(msg);
        }
        Ok(())
    }

    fn add_history(&mut self, msg: Arc<Message>) {
        if self.history.len() == HISTORY_CAP {
            if let Some(evicted) = self.history.pop_front() {
                if let Some(ref id) = evicted.id {
                    self.msgs.remove(id);
                }
            }
        }
        if let Some(ref id) = msg.id {
            self.msgs.insert(id.clone(), msg.clone());
        }
        self.history.push_back(msg);
    }

    /// Build a `Message` from a `b`/`i` argument list.
    fn parse_message(&mut self, args: &[&str]) -> Result<Message> {
        if args.len() < 9 {
            return Err(Error::Malformed("message frame"));
        }
        let time = args[0]
            .parse::<f64>()
            .map_err(|_| Error::Malformed("message time"))?
            - self.time_correction;
        let (name, tname, puid, unid, temp_id, ip) =
            (args[1], args[2], args[3], args[4], args[5], args[6]);
        let flags = MessageFlags::from_bits_truncate(args[7].parse().unwrap_or(0));
        let raw = wire::rejoin(args, 9);

        let (cleaned, name_tag, font_tag) = clean_message(&raw, false);
        let body = normalize_trailing(&cleaned);

        let mut name_color = None;
        let mut is_anon = false;
        let name = if name.is_empty() {
            is_anon = true;
            if tname.is_empty() {
                let seed = if name_tag == "None" { "" } else { name_tag.as_str() };
                anon_name(seed, puid)
            } else {
                tname.to_owned()
            }
        } else {
            if !name_tag.is_empty() {
                name_color = Some(name_tag.clone());
            }
            name.to_owned()
        };

        let user = self.registry.intern_with(
            &name,
            UserAttrs {
                is_anon: Some(is_anon),
                puid: Some(puid.to_owned()),
                ip: Some(ip.to_owned()),
            },
        );
        if let Some(color) = name_color {
            user.update_styles(|styles| styles.name_color = color);
        }
        if !font_tag.is_empty() {
            let font = parse_font(font_tag.trim());
            user.update_styles(|styles| {
                styles.font_size = font.size;
                styles.font_color = font.color;
                styles.font_face = font.face;
            });
        }
        if flags.contains(MessageFlags::BG_ON) && flags.contains(MessageFlags::PREMIUM) {
            user.update_styles(|styles| styles.use_background = 1);
        }

        let mut mentions = Vec::new();
        let roster = self.all_user_list();
        for candidate in mention_candidates(&body) {
            if let Some(found) = roster.iter().find(|user| user.name() == candidate) {
                if !mentions.contains(found) {
                    mentions.push(found.clone());
                }
            }
        }

        let is_premium = flags.contains(MessageFlags::PREMIUM);
        if user.is_premium() != Some(is_premium) {
            let recent = user.is_premium().is_some() && time > unix_now() - 5.0;
            user.set_premium(is_premium);
            if recent {
                self.events.emit(Event::PremiumChange {
                    user: user.clone(),
                    premium: is_premium,
                });
            }
        }

        Ok(Message {
            id: None,
            temp_id: temp_id.to_owned(),
            user: user.clone(),
            time,
            ip: ip.to_owned(),
            puid: puid.to_owned(),
            unid: unid.to_owned(),
            body,
            raw,
            flags,
            mentions,
            channel: Channel {
                room: self.name.clone(),
                user,
            },
        })
    }

    fn rcmd_delete(&mut self, args: &[&str]) -> Result<()> {
        let id = args.first().ok_or(Error::Malformed("delete frame"))?;
        if let Some(msg) = self.msgs.remove(*id) {
            self.history.retain(|kept| kept.id.as_deref() != Some(*id));
            self.events.emit(Event::DeleteMessage {
                user: msg.user.clone(),
                message: msg,
            });
        }
        if self.history.len() < 20 && !self.no_more {
            self.conn.send(&["get_more", "20", "0"]);
        }
        Ok(())
    }

    fn rcmd_deleteall(&mut self, args: &[&str]) -> Result<()> {
        let mut user = None;
        let mut messages = Vec::new();
        for id in args {
            if let Some(msg) = self.msgs.remove(*id) {
                self.history.retain(|kept| kept.id.as_deref() != Some(*id));
                user = Some(msg.user.clone());
                messages.push(msg);
            }
        }
        if !messages.is_empty() {
            self.events.emit(Event::DeleteUser { user, messages });
        }
        Ok(())
    }

    fn rcmd_clearall(&mut self, args: &[&str]) -> Result<()> {
        self.events
            .emit(Event::ClearAll(args.first().unwrap_or(&"").to_string()));
        Ok(())
    }

    // ---- roster ----------------------------------------------------------

    fn rcmd_g_participants(&mut self, args: &[&str]) -> Result<()> {
        self.participants.clear();
        let joined = args.join(":");
        for record in joined.split(';') {
            let fields: Vec<&str> = record.split(':').collect();
            if fields.len() < 5 {
                continue;
            }
            let (ssid, contime, puid, name, tname) =
                (fields[0], fields[1], fields[2], fields[3], fields[4]);
            let mut is_anon = false;
            let name = if name == "None" {
                is_anon = true;
                if tname != "None" {
                    tname.to_owned()
                } else {
                    anon_name(contime, puid)
                }
            } else {
                name.to_owned()
            };
            let user = self.registry.intern_with(
                &name,
                UserAttrs {
                    is_anon: Some(is_anon),
                    puid: Some(puid.to_owned()),
                    ip: None,
                },
            );
            if self.owner.as_ref() == Some(&user) || self.mods.contains_key(&user) {
                user.set_show_name(&name);
            }
            user.add_session(&self.name, ssid);
            self.participants
                .insert(ssid.to_owned(), (contime.to_owned(), user));
        }
        Ok(())
    }

    /// Old form of the roster dump; the service still sends it for big
    /// rooms. The leading count is dropped and the rest reparsed.
    fn rcmd_gparticipants(&mut self, args: &[&str]) -> Result<()> {
        if args.len() > 1 {
            self.rcmd_g_participants(&args[1..])
        } else {
            self.rcmd_g_participants(&[])
        }
    }

    fn rcmd_participant(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 7 {
            return Err(Error::Malformed("participant frame"));
        }
        let (change, ssid, puid, name, tname, ip, contime) =
            (args[0], args[1], args[2], args[3], args[4], args[5], args[6]);

        let mut is_anon = false;
        let name = if name == "None" {
            is_anon = true;
            if tname != "None" {
                tname.to_owned()
            } else {
                anon_name(contime, puid)
            }
        } else {
            name.to_owned()
        };
        let user = self.registry.intern_with(
            &name,
            UserAttrs {
                is_anon: Some(is_anon),
                puid: Some(puid.to_owned()),
                ip: Some(ip.to_owned()),
            },
        );
        user.set_show_name(&name);

        let before = self.participants.get(ssid).map(|(_, user)| user.clone());

        if change == "0" {
            // leave
            user.remove_session(&self.name, Some(ssid));
            if let Some((_, left)) = self.participants.remove(ssid) {
                self.push_participant_history(contime, left);
            }
            if user.is_anon() {
                self.events.emit(Event::AnonLeave(user));
            } else {
                self.events.emit(Event::Leave(user));
            }
        } else if change == "1" || before.is_none() {
            // join; a second tab of a present user emits nothing
            let already_listed = !user.is_anon() && self.user_list().contains(&user);
            user.add_session(&self.name, ssid);
            self.participants
                .insert(ssid.to_owned(), (contime.to_owned(), user.clone()));
            self.participant_history.retain(|(_, seen)| seen != &user);
            if user.is_anon() {
                self.events.emit(Event::AnonJoin(user));
            } else if !already_listed {
                self.events.emit(Event::Join(user));
            }
        } else if let Some(before) = before {
            // login/logout transition on an existing session
            if before.is_anon() {
                if user.is_anon() {
                    self.events.emit(Event::AnonLogin {
                        before: before.clone(),
                        user: user.clone(),
                    });
                } else {
                    self.events.emit(Event::UserLogin {
                        before: before.clone(),
                        user: user.clone(),
                    });
                }
            } else if self.user_list().contains(&before) {
                self.push_participant_history(contime, before.clone());
                self.events.emit(Event::UserLogout {
                    before: before.clone(),
                    user: user.clone(),
                });
            }
            before.remove_session(&self.name, Some(ssid));
            user.add_session(&self.name, ssid);
            self.participants
                .insert(ssid.to_owned(), (contime.to_owned(), user));
        }
        Ok(())
    }

    fn push_participant_history(&mut self, contime: &str, user: User) {
        self.participant_history.retain(|(_, seen)| seen != &user);
        if self.participant_history.len() == USER_HISTORY_CAP {
            self.participant_history.pop_front();
        }
        self.participant_history
            .push_back((contime.to_owned(), user));
    }

    // ---- moderators ------------------------------------------------------

    fn rcmd_mods(&mut self, args: &[&str]) -> Result<()> {
        // a lone empty argument means the last mod was removed
        let mut new_mods = HashMap::new();
        for entry in args.iter().filter(|entry| !entry.is_empty()) {
            if let Some((name, power)) = entry.split_once(',') {
                let flags = ModeratorFlags::from_bits_truncate(power.parse().unwrap_or(0));
                new_mods.insert(self.registry.intern(name), flags);
            }
        }
        let previous = std::mem::replace(&mut self.mods, new_mods);

        for user in self.mods.keys() {
            if !previous.contains_key(user) {
                self.events.emit(Event::ModAdded(user.clone()));
            }
        }
        for user in previous.keys() {
            if !self.mods.contains_key(user) {
                self.events.emit(Event::ModRemove(user.clone()));
            }
        }
        for (user, flags) in &self.mods {
            if let Some(old) = previous.get(user) {
                if old != flags {
                    self.events.emit(Event::ModsChange(user.clone(), *flags));
                }
            }
        }
        Ok(())
    }

    fn rcmd_groupflagsupdate(&mut self, args: &[&str]) -> Result<()> {
        let bits = args
            .first()
            .and_then(|raw| raw.parse().ok())
            .ok_or(Error::Malformed("groupflagsupdate frame"))?;
        self.flags = RoomFlags::from_bits_truncate(bits);
        self.events.emit(Event::GroupFlags(self.flags));
        Ok(())
    }

    fn rcmd_updatemoderr(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 2 {
            return Err(Error::Malformed("updatemoderr frame"));
        }
        self.events.emit(Event::ModUpdateError {
            user: self.registry.intern(args[1]),
            kind: args[0].to_owned(),
        });
        Ok(())
    }

    // ---- bans ------------------------------------------------------------

    fn rcmd_blocked(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 5 {
            return Err(Error::Malformed("blocked frame"));
        }
        let (unid, ip, target_name, by_name, time) =
            (args[0], args[1], args[2], args[3], args[4]);
        let by = self.registry.intern(by_name);
        let (target, anon) = if target_name.is_empty() {
            (self.user_by_unid(unid), true)
        } else {
            (self.registry.intern(target_name), false)
        };
        self.ban_list.insert(
            target.clone(),
            BanRecord {
                unid: unid.to_owned(),
                ip: ip.to_owned(),
                target: target.clone(),
                time: time.parse().unwrap_or(0.0),
                src: by.clone(),
            },
        );
        if anon {
            self.events.emit(Event::AnonBan { by, target });
        } else {
            self.events.emit(Event::Ban { by, target });
        }
        Ok(())
    }

    /// Resolve a ban target for an anonymous author by scanning the history
    /// for the message carrying this unid.
    fn user_by_unid(&self, unid: &str) -> User {
        self.history
            .iter()
            .find(|msg| msg.unid == unid)
            .map(|msg| msg.user.clone())
            .unwrap_or_else(|| {
                self.registry.intern_with(
                    "anon",
                    UserAttrs {
                        is_anon: Some(true),
                        ..UserAttrs::default()
                    },
                )
            })
    }

    fn rcmd_blocklist(&mut self, args: &[&str]) -> Result<()> {
        self.ban_list.clear();
        let joined = args.join(":");
        for section in joined.split(';') {
            let fields: Vec<&str> = section.split(':').collect();
            if fields.len() != 5 || fields[2].is_empty() {
                continue;
            }
            let target = self.registry.intern(fields[2]);
            self.ban_list.insert(
                target.clone(),
                BanRecord {
                    unid: fields[0].to_owned(),
                    ip: fields[1].to_owned(),
                    target,
                    time: fields[3].parse().unwrap_or(0.0),
                    src: self.registry.intern(fields[4]),
                },
            );
        }
        self.events.emit(Event::BanlistUpdate);
        Ok(())
    }

    fn rcmd_unblocked(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 5 {
            return Err(Error::Malformed("unblocked frame"));
        }
        let unid = args[0];
        let ip = args[1];
        let target_name = args[2].split(';').next().unwrap_or("");
        let by = self.registry.intern(args[args.len() - 2]);
        let time: f64 = args[args.len() - 1].parse().unwrap_or(0.0);

        let (target, anon) = if target_name.is_empty() {
            (self.user_by_unid(unid), true)
        } else {
            (self.registry.intern(target_name), false)
        };
        self.push_unban(BanRecord {
            unid: unid.to_owned(),
            ip: ip.to_owned(),
            target: target.clone(),
            time,
            src: by.clone(),
        });
        self.ban_list.remove(&target);
        if anon {
            self.events.emit(Event::AnonUnban { by, target });
        } else {
            self.events.emit(Event::Unban { by, target });
        }
        Ok(())
    }

    fn rcmd_unblocklist(&mut self, args: &[&str]) -> Result<()> {
        let joined = args.join(":");
        for section in joined.split(';').rev() {
            let fields: Vec<&str> = section.split(':').collect();
            if fields.len() != 5 {
                continue;
            }
            let target = self.registry.intern(if fields[2].is_empty() {
                "anon"
            } else {
                fields[2]
            });
            self.push_unban(BanRecord {
                unid: fields[0].to_owned(),
                ip: fields[1].to_owned(),
                target,
                time: fields[3].parse().unwrap_or(0.0),
                src: self.registry.intern(fields[4]),
            });
        }
        self.events.emit(Event::UnbanlistUpdate);
        Ok(())
    }

    /// The unban queue is a log: duplicates stay, overflow drops the oldest.
    fn push_unban(&mut self, record: BanRecord) {
        if self.unban_queue.len() == UNBAN_QUEUE_CAP {
            self.unban_queue.pop_front();
        }
        self.unban_queue.push_back(record);
    }

    // ---- announcements and notices --------------------------------------

    fn rcmd_annc(&mut self, args: &[&str]) -> Result<()> {
        let enabled = args
            .first()
            .ok_or(Error::Malformed("annc frame"))?
            .parse()
            .unwrap_or(0);
        self.announcement.0 = enabled;
        let body = wire::rejoin(args, 2);
        if body != self.announcement.2 {
            self.announcement.2 = body.clone();
            self.events
                .emit(Event::AnnouncementUpdate(args[0] != "0"));
        }
        self.events.emit(Event::Announcement(body));
        Ok(())
    }

    fn rcmd_getannc(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 4 || args[0] == "none" {
            return Ok(());
        }
        self.announcement = (
            args[0].parse().unwrap_or(0),
            args[3].parse().unwrap_or(0),
            wire::rejoin(args, 4),
        );
        Ok(())
    }

    fn rcmd_denied(&mut self, _args: &[&str]) -> Result<()> {
        // no redial even if the listen loop was asked to reconnect
        self.reconnect = false;
        self.conn.disconnect();
        self.events.emit(Event::RoomDenied(self.name.clone()));
        Ok(())
    }

    fn rcmd_proxybanned(&mut self, _args: &[&str]) -> Result<()> {
        self.events.emit(Event::ProxyBanned);
        Ok(())
    }

    fn rcmd_show_fw(&mut self, _args: &[&str]) -> Result<()> {
        // arrives both bare and with arguments; they carry nothing we need
        self.events.emit(Event::FloodWarning);
        Ok(())
    }

    fn rcmd_show_tb(&mut self, args: &[&str]) -> Result<()> {
        let seconds = args
            .first()
            .and_then(|raw| raw.parse().ok())
            .ok_or(Error::Malformed("show_tb frame"))?;
        self.events.emit(Event::ShowTempBan(seconds));
        Ok(())
    }

    fn rcmd_tb(&mut self, args: &[&str]) -> Result<()> {
        let seconds = args
            .first()
            .and_then(|raw| raw.parse().ok())
            .ok_or(Error::Malformed("tb frame"))?;
        self.events.emit(Event::TempBan(seconds));
        Ok(())
    }

    fn rcmd_miu(&mut self, args: &[&str]) -> Result<()> {
        let name = args.first().ok_or(Error::Malformed("miu frame"))?;
        self.events.emit(Event::BgReload(self.registry.intern(name)));
        Ok(())
    }

    fn rcmd_msglexceeded(&mut self, _args: &[&str]) -> Result<()> {
        self.events.emit(Event::MessageLengthExceeded);
        Ok(())
    }

    fn rcmd_bw(&mut self, args: &[&str]) -> Result<()> {
        let part = args
            .first()
            .map(|raw| urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_default())
            .unwrap_or_default();
        let whole = args
            .get(1)
            .map(|raw| urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_default())
            .unwrap_or_default();
        self.events.emit(Event::BannedWords { part, whole });
        Ok(())
    }

    fn rcmd_ubw(&mut self, args: &[&str]) -> Result<()> {
        self.unbanned_words = args.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    fn rcmd_getratelimit(&mut self, args: &[&str]) -> Result<()> {
        debug!("rate limit: {:?}", args);
        Ok(())
    }

    fn rcmd_climited(&mut self, args: &[&str]) -> Result<()> {
        debug!("command rate limited: {:?}", args);
        Ok(())
    }

    fn rcmd_show_nlp(&mut self, _args: &[&str]) -> Result<()> {
        debug!("auto-moderation notice");
        Ok(())
    }

    fn rcmd_nlptb(&mut self, _args: &[&str]) -> Result<()> {
        debug!("auto-moderation temporary ban");
        Ok(())
    }

    fn rcmd_premium(&mut self, args: &[&str]) -> Result<()> {
        let premium = args.first() == Some(&"210");
        if self.bg_mode != 0
            && (premium || (self.owner.is_some() && self.owner == self.self_user))
        {
            if let Some(ref user) = self.self_user {
                user.set_premium(true);
            }
            self.conn.send(&["msgbg", &self.bg_mode.to_string()]);
        }
        Ok(())
    }

    fn rcmd_logoutfirst(&mut self, _args: &[&str]) -> Result<()> {
        debug!("server asked for a logout before re-login");
        Ok(())
    }

    fn rcmd_logoutok(&mut self, _args: &[&str]) -> Result<()> {
        let user = self.anon_self_user();
        self.self_user = Some(user.clone());
        self.events.emit(Event::Logout(user));
        Ok(())
    }

    fn rcmd_updateprofile(&mut self, args: &[&str]) -> Result<()> {
        let name = args.first().ok_or(Error::Malformed("updateprofile frame"))?;
        let user = self.registry.intern(name);
        user.clear_profile();
        self.events.emit(Event::ProfileChanges(user));
        Ok(())
    }

    fn rcmd_reload_profile(&mut self, args: &[&str]) -> Result<()> {
        let name = args
            .first()
            .ok_or(Error::Malformed("reload_profile frame"))?;
        let user = self.registry.intern(name);
        user.clear_profile();
        self.events.emit(Event::ProfileReload(user));
        Ok(())
    }

    // ---- outbound API ----------------------------------------------------

    /// Send a chat message, wrapped in the user's style tags and split into
    /// server-sized chunks. Suppressed while the room is silenced.
    pub fn send_message(&self, text: &str, use_html: bool) {
        if self.silent {
            return;
        }
        let flags = self.message_flags | self.badge_flags();
        let mut body = if use_html {
            text.to_owned()
        } else {
            escape_html(text)
        };
        body = body.replace('\n', "\r").replace('~', "&#126;");
        let styles = self
            .self_user
            .as_ref()
            .map(|user| user.styles())
            .unwrap_or_default();
        for chunk in message_cut(&body, MAX_MESSAGE_LEN) {
            let wrapped = format!(
                "<n{}/><f x{}{}=\"{}\">{}</f>",
                styles.name_color, styles.font_size, styles.font_color, styles.font_face, chunk
            );
            self.conn
                .send(&["bm", &message_tag(), &flags.to_string(), &wrapped]);
        }
    }

    fn badge_flags(&self) -> u32 {
        match self.badge {
            1 => MessageFlags::SHOW_MOD_ICON.bits(),
            2 => MessageFlags::SHOW_STAFF_ICON.bits(),
            _ => 0,
        }
    }

    /// Choose the badge shown on outbound messages: 0 none, 1 mod, 2 staff.
    pub fn set_badge(&mut self, badge: u32) {
        self.badge = badge;
    }

    /// Upgrade an anonymous connection to an account.
    pub fn login(&mut self, user_name: &str, password: &str) {
        self.self_user = Some(self.registry.intern_with(
            user_name,
            UserAttrs {
                is_anon: Some(password.is_empty()),
                ..UserAttrs::default()
            },
        ));
        self.conn.send(&["blogin", user_name, password]);
    }

    /// Downgrade back to the anon identity.
    pub fn logout(&self) {
        self.conn.send(&["blogout"]);
    }

    /// Delete one message, id permitting. Returns whether a command went out.
    pub fn delete_message(&self, message: &Message) -> bool {
        let allowed = self
            .self_user
            .as_ref()
            .map(|user| self.get_level(user) > 0)
            .unwrap_or(false);
        if let (true, Some(id)) = (allowed, message.id.as_ref()) {
            self.conn.send(&["delmsg", id]);
            return true;
        }
        false
    }

    /// Delete the last message a user sent.
    pub fn delete_user_message(&self, user: &User) -> bool {
        match self.get_last_message(Some(user)) {
            Some(msg) => self.delete_message(&msg),
            None => false,
        }
    }

    /// Delete everything a user posted, keyed off their last message.
    pub fn clear_user(&self, user: &User) -> bool {
        let allowed = self
            .self_user
            .as_ref()
            .map(|me| self.get_level(me) > 0)
            .unwrap_or(false);
        if !allowed {
            return false;
        }
        if let Some(msg) = self.get_last_message(Some(user)) {
            let name = if msg.user.is_anon() {
                String::new()
            } else {
                msg.user.name().to_owned()
            };
            self.conn.send(&["delallmsg", &msg.unid, &msg.ip, &name]);
            return true;
        }
        false
    }

    /// Purge the whole room, privileges permitting.
    pub fn clear_all(&self) -> bool {
        let allowed = self.self_user.as_ref().is_some_and(|me| {
            self.owner.as_ref() == Some(me)
                || self
                    .mods
                    .get(me)
                    .is_some_and(|flags| flags.contains(ModeratorFlags::EDIT_GROUP))
        });
        if allowed {
            self.conn.send(&["clearall"]);
        }
        allowed
    }

    /// Ban the author of a message.
    pub fn ban_message(&self, message: &Message) -> bool {
        let allowed = self
            .self_user
            .as_ref()
            .map(|me| self.get_level(me) > 0)
            .unwrap_or(false);
        if !allowed {
            return false;
        }
        let name = if message.user.is_anon() {
            String::new()
        } else {
            message.user.name().to_owned()
        };
        self.conn.send(&["block", &message.unid, &message.ip, &name]);
        true
    }

    /// Ban a user by name, keyed off their last message.
    pub fn ban_user(&self, name: &str) -> bool {
        let user = self.registry.intern(name);
        if self.ban_list.contains_key(&user) {
            return false;
        }
        match self.get_last_message(Some(&user)) {
            Some(msg) => self.ban_message(&msg),
            None => false,
        }
    }

    /// Lift a ban, if one is recorded.
    pub fn unban_user(&self, user: &User) -> bool {
        match self.ban_list.get(user) {
            Some(record) => {
                self.conn.send(&[
                    "removeblock",
                    &record.unid,
                    &record.ip,
                    record.target.name(),
                ]);
                true
            }
            None => false,
        }
    }

    /// Replace the room's banned word lists, privileges permitting.
    pub fn set_banned_words(&self, part: &str, whole: &str) -> bool {
        let allowed = self.self_user.as_ref().is_some_and(|me| {
            self.mods
                .get(me)
                .is_some_and(|flags| flags.contains(ModeratorFlags::EDIT_BW))
        });
        if allowed {
            self.conn.send(&[
                "setbannedwords",
                &urlencoding::encode(part),
                &urlencoding::encode(whole),
            ]);
        }
        allowed
    }

    /// Ask for the current ban list.
    pub fn request_banlist(&self) {
        let stamp = format!("{}", (unix_now() + self.time_correction) as i64);
        self.conn
            .send(&["blocklist", "block", &stamp, "next", "500", "anons", "1"]);
    }

    /// Ask for the recent unbans.
    pub fn request_unbanlist(&self) {
        let stamp = format!("{}", (unix_now() + self.time_correction) as i64);
        self.conn
            .send(&["blocklist", "unblock", &stamp, "next", "500", "anons", "1"]);
    }

    /// Turn message backgrounds on or off; takes effect when the premium
    /// check comes back.
    pub fn set_bg_mode(&mut self, mode: u32) {
        self.bg_mode = mode;
        if self.conn.is_connected() {
            self.conn.send(&["getpremium", "l"]);
            if self
                .self_user
                .as_ref()
                .is_some_and(|user| user.is_premium() == Some(true))
            {
                self.conn.send(&["msgbg", &mode.to_string()]);
            }
        }
    }

    pub fn enable_bg(&mut self) {
        self.set_bg_mode(1);
    }

    pub fn disable_bg(&mut self) {
        self.set_bg_mode(0);
    }

    /// Override parts of the style used for outbound messages.
    pub fn set_font(
        &mut self,
        name_color: Option<&str>,
        font_color: Option<&str>,
        font_size: Option<u32>,
        font_face: Option<&str>,
    ) {
        if let Some(ref user) = self.self_user {
            user.update_styles(|styles| {
                if let Some(color) = name_color {
                    styles.name_color = color.to_owned();
                }
                if let Some(color) = font_color {
                    styles.font_color = color.to_owned();
                }
                if let Some(size) = font_size {
                    styles.font_size = size;
                }
                if let Some(face) = font_face {
                    styles.font_face = face.to_owned();
                }
            });
        }
    }

    /// The offset applied to every server timestamp this session, fixed by
    /// the `ok` frame.
    pub fn time_correction(&self) -> f64 {
        self.time_correction
    }

    #[cfg(test)]
    pub(crate) fn queues(&self) -> (usize, usize) {
        (self.mqueue.len(), self.uqueue.len())
    }

    #[cfg(test)]
    pub(crate) fn participant_history(&self) -> &VecDeque<(String, User)> {
        &self.participant_history
    }

    #[cfg(test)]
    pub(crate) fn participants(&self) -> &HashMap<String, (String, User)> {
        &self.participants
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// The 16-digit decimal uid generated once per connection.
fn gen_uid() -> String {
    rand::thread_rng()
        .gen_range(1_000_000_000_000_000u64..10_000_000_000_000_000u64)
        .to_string()
}

/// The 4-letter tag carried by outbound `bm` commands.
fn message_tag() -> String {
    let mut rng = rand::thread_rng();
    (0..4).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::with_registry("testroom", Arc::new(UserRegistry::new())).unwrap()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn name_validation() {
        assert!(Room::validate_name("a-room-1").is_ok());
        assert!(matches!(
            Room::validate_name("Bad Room"),
            Err(Error::InvalidRoomName(_))
        ));
        assert!(Room::validate_name("").is_err());
        assert!(Room::validate_name(&"x".repeat(21)).is_err());
    }

    #[test]
    fn reconciliation_is_order_independent() {
        // payload first
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("b:1700000001.0:alice::PUID1:UNID1:MID1:1.1.1.1:0:11:hi there");
        assert_eq!(room.queues(), (1, 0));
        room.handle_command("u:MID1:FINAL1");
        assert_eq!(room.queues(), (0, 0));
        let events = drain(&mut rx);
        let msgs: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Message(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id.as_deref(), Some("FINAL1"));
        assert_eq!(msgs[0].body, "hi there");
        assert_eq!(msgs[0].user.name(), "alice");

        // binding first
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("u:MID2:FINAL2");
        assert_eq!(room.queues(), (0, 1));
        room.handle_command("b:1700000001.0:alice::PUID1:UNID1:MID2:1.1.1.1:0:11:hello");
        assert_eq!(room.queues(), (0, 0));
        let events = drain(&mut rx);
        let msgs: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Message(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id.as_deref(), Some("FINAL2"));
        assert_eq!(msgs[0].body, "hello");
    }

    #[test]
    fn history_is_bounded_and_indexed() {
        let mut room = test_room();
        for i in 0..3000 {
            room.handle_command(&format!(
                "b:1700000001.0:alice::P:U:M{}:1.1.1.1:0:11:msg {}",
                i, i
            ));
            room.handle_command(&format!("u:M{}:F{}", i, i));
        }
        assert_eq!(room.history().len(), 2900);
        assert_eq!(room.msgs.len(), 2900);
        // the first hundred were evicted, front first
        assert!(room.message_by_id("F0").is_none());
        assert!(room.message_by_id("F99").is_none());
        assert!(room.message_by_id("F100").is_some());
        assert_eq!(
            room.history().front().unwrap().id.as_deref(),
            Some("F100")
        );
    }

    #[test]
    fn deletes_update_both_views() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("b:1700000001.0:alice::P:U:M1:1.1.1.1:0:11:one");
        room.handle_command("u:M1:F1");
        room.handle_command("b:1700000001.0:alice::P:U:M2:1.1.1.1:0:11:two");
        room.handle_command("u:M2:F2");
        room.handle_command("delete:F1");
        assert!(room.message_by_id("F1").is_none());
        assert_eq!(room.history().len(), 1);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::DeleteMessage { .. })));

        room.handle_command("deleteall:F2");
        assert!(room.history().is_empty());
        assert!(room.msgs.is_empty());
    }

    #[test]
    fn roster_deltas_keep_sessions_consistent() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("participant:1:S1:P1:None:None:9.9.9.9:1700000002.0");
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            Event::AnonJoin(user) if user.name().starts_with("anon")
        )));
        assert!(room.participants().contains_key("S1"));

        // the invariant: every roster ssid is in the user's session set
        for (ssid, (_, user)) in room.participants() {
            assert!(user.session_ids(room.name()).contains(ssid));
        }

        room.handle_command("participant:1:S2:P2:bob:None:8.8.8.8:1700000003.0");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Join(user) if user.name() == "bob")));

        // login transition on the anon session
        room.handle_command("participant:2:S1:P1:carol:None:9.9.9.9:1700000004.0");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::UserLogin { user, .. } if user.name() == "carol")));
        for (ssid, (_, user)) in room.participants() {
            assert!(user.session_ids(room.name()).contains(ssid));
        }

        room.handle_command("participant:0:S2:P2:bob:None:8.8.8.8:1700000005.0");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Leave(user) if user.name() == "bob")));
        assert!(!room.participants().contains_key("S2"));
        assert!(room
            .participant_history()
            .iter()
            .any(|(_, user)| user.name() == "bob"));
    }

    #[test]
    fn second_tab_join_is_silent() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("participant:1:S1:P1:dave:None:1.1.1.1:1700000002.0");
        drain(&mut rx);
        room.handle_command("participant:1:S2:P1:dave:None:1.1.1.1:1700000003.0");
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|event| matches!(event, Event::Join(_))));
        assert_eq!(room.user_list().len(), 1);
        assert_eq!(
            room.user_list()[0].session_ids(room.name()).len(),
            2
        );
    }

    #[test]
    fn mod_diff_emits_exactly_the_changes() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("mods:alice,2:bob,4");
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, Event::ModAdded(_)))
                .count(),
            2
        );

        room.handle_command("mods:alice,6:carol,8");
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, Event::ModAdded(user) if user.name() == "carol"))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, Event::ModRemove(user) if user.name() == "bob"))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(
                    |event| matches!(event, Event::ModsChange(user, _) if user.name() == "alice")
                )
                .count(),
            1
        );

        // a single empty argument: the last mods are gone
        room.handle_command("mods:");
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, Event::ModRemove(_)))
                .count(),
            2
        );
        assert!(room.mods().is_empty());
    }

    #[test]
    fn ban_bookkeeping() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("blocked:UNID9:9.9.9.9:victim:modx:1700000003.0");
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            Event::Ban { by, target } if by.name() == "modx" && target.name() == "victim"
        )));
        assert_eq!(room.ban_list().len(), 1);

        room.handle_command("unblocked:UNID9:9.9.9.9:victim:modx:1700000004.0");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Unban { .. })));
        assert!(room.ban_list().is_empty());
        assert_eq!(room.unban_list().len(), 1);
    }

    #[test]
    fn anon_ban_resolves_through_history() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("b:1700000001.0:::PUID1:UNIDA:MID1:1.1.1.1:0:11:anon talk");
        room.handle_command("u:MID1:F1");
        drain(&mut rx);
        room.handle_command("blocked:UNIDA:1.1.1.1::modx:1700000003.0");
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            Event::AnonBan { target, .. } if target.name().starts_with("anon")
        )));
    }

    #[test]
    fn blocklist_replaces_whole_table() {
        let mut room = test_room();
        room.handle_command("blocked:U1:1.1.1.1:olduser:modx:1700000000.0");
        room.handle_command(
            "blocklist:U2:2.2.2.2:alice:1700000001.0:modx;U3:3.3.3.3:bob:1700000002.0:modx",
        );
        let names: Vec<String> = room
            .ban_list()
            .iter()
            .map(|user| user.name().to_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"alice".to_owned()));
        assert!(names.contains(&"bob".to_owned()));
    }

    #[test]
    fn announcement_update_fires_only_on_change() {
        let mut room = test_room();
        let mut rx = room.subscribe();
        room.handle_command("annc:1:testroom:hello");
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::AnnouncementUpdate(true))));
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Announcement(body) if body == "hello")));

        room.handle_command("annc:1:testroom:hello");
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|event| matches!(event, Event::AnnouncementUpdate(_))));
    }

    #[test]
    fn user_count_prefers_roster_when_uncounted() {
        let mut room = test_room();
        room.handle_command("n:2a");
        assert_eq!(room.user_count(), 0x2a);
        room.flags = RoomFlags::NO_COUNTER;
        room.handle_command("participant:1:S1:P1:eve:None:1.1.1.1:1700000002.0");
        assert_eq!(room.user_count(), 1);
    }

    #[test]
    fn unknown_and_broken_frames_are_dropped() {
        let mut room = test_room();
        room.handle_command("nosuchverb:1:2:3");
        room.handle_command("b:notatime:x");
        room.handle_command("u:only-one-arg");
        assert!(room.history().is_empty());
    }
}
