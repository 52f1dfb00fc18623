//! Users and the process-wide registry that interns them.
//!
//! The protocol streams the same user through many contexts (roster entries,
//! message authors, ban records), and identity checks like "is this author a
//! moderator" have to hold across all of them. Users are therefore interned
//! by lowercase name: constructing the same name twice yields the same
//! record, and equality is name equality.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};

use bitflags::bitflags;

bitflags! {
    /// Moderator capability bits as sent in `ok` and `mods` frames.
    pub struct ModeratorFlags: u32 {
        const DELETED = 1 << 0;
        const EDIT_MODS = 1 << 1;
        const EDIT_MOD_VISIBILITY = 1 << 2;
        const EDIT_BW = 1 << 3;
        const EDIT_RESTRICTIONS = 1 << 4;
        const EDIT_GROUP = 1 << 5;
        const SEE_COUNTER = 1 << 6;
        const SEE_MOD_CHANNEL = 1 << 7;
        const SEE_MOD_ACTIONS = 1 << 8;
        const EDIT_NLP = 1 << 9;
        const EDIT_GP_ANNC = 1 << 10;
        const EDIT_ADMINS = 1 << 11;
        const EDIT_SUPERMODS = 1 << 12;
        const NO_SENDING_LIMITATIONS = 1 << 13;
        const SEE_IPS = 1 << 14;
        const CLOSE_GROUP = 1 << 15;
        const CAN_BROADCAST = 1 << 16;
        const MOD_ICON_VISIBLE = 1 << 17;
        const IS_STAFF = 1 << 18;
        const STAFF_ICON_VISIBLE = 1 << 19;

        /// The mask a moderator must intersect to count as an admin.
        const ADMIN = Self::EDIT_MODS.bits
            | Self::EDIT_RESTRICTIONS.bits
            | Self::EDIT_GROUP.bits
            | Self::EDIT_GP_ANNC.bits;
    }
}

impl ModeratorFlags {
    /// Whether any bit of the admin mask is set.
    pub fn is_admin(self) -> bool {
        self.intersects(ModeratorFlags::ADMIN)
    }
}

/// A user's message styling plus the opaque profile blob.
#[derive(Debug, Clone)]
pub struct Styles {
    pub name_color: String,
    pub font_color: String,
    pub font_size: u32,
    pub font_face: String,
    pub use_background: u32,
    /// Attributes of the `msgbg.xml` background descriptor, unparsed beyond
    /// key/value splitting.
    pub bg_style: HashMap<String, String>,
    /// Raw profile document, kept opaque.
    pub profile: Option<String>,
}

impl Default for Styles {
    fn default() -> Styles {
        let bg_style = [
            ("align", ""),
            ("bgc", ""),
            ("bgalp", ""),
            ("hasrec", "0"),
            ("ialp", ""),
            ("isvid", "0"),
            ("tile", "0"),
            ("useimg", "0"),
        ]
        .iter()
        .map(|&(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
        Styles {
            name_color: "000000".to_owned(),
            font_color: "000000".to_owned(),
            font_size: 11,
            font_face: "0".to_owned(),
            use_background: 0,
            bg_style,
            profile: None,
        }
    }
}

#[derive(Debug, Default)]
struct UserData {
    show_name: String,
    ip: Option<String>,
    puid: String,
    is_anon: bool,
    /// Tri-state: unknown until the first message flag is seen.
    is_premium: Option<bool>,
    /// Session ids per room name; a user can sit in several rooms, and in
    /// one room under several tabs.
    sessions: HashMap<String, HashSet<String>>,
    styles: Styles,
}

/// A shared, interned user record.
///
/// Cloning is cheap and clones refer to the same record. Equality and
/// hashing go by lowercase name only.
#[derive(Clone)]
pub struct User {
    name: Arc<str>,
    data: Arc<Mutex<UserData>>,
}

impl User {
    fn with_name(name: &str) -> User {
        User {
            name: name.to_lowercase().into(),
            data: Arc::new(Mutex::new(UserData {
                show_name: name.to_owned(),
                ..UserData::default()
            })),
        }
    }

    /// Lowercase account name, the identity key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display-cased name.
    pub fn show_name(&self) -> String {
        self.lock().show_name.clone()
    }

    /// Update the display casing. The lowercase identity never changes.
    pub fn set_show_name(&self, show_name: &str) {
        self.lock().show_name = show_name.to_owned();
    }

    pub fn is_anon(&self) -> bool {
        self.lock().is_anon
    }

    pub fn set_anon(&self, is_anon: bool) {
        self.lock().is_anon = is_anon;
    }

    pub fn ip(&self) -> Option<String> {
        self.lock().ip.clone()
    }

    pub fn puid(&self) -> String {
        self.lock().puid.clone()
    }

    /// Premium status: `None` until a message has told us either way.
    pub fn is_premium(&self) -> Option<bool> {
        self.lock().is_premium
    }

    pub fn set_premium(&self, premium: bool) {
        self.lock().is_premium = Some(premium);
    }

    /// Record a session id for this user in `room`.
    pub fn add_session(&self, room: &str, ssid: &str) {
        self.lock()
            .sessions
            .entry(room.to_owned())
            .or_default()
            .insert(ssid.to_owned());
    }

    /// Drop one session id, or every session in the room when `ssid` is
    /// `None`. Empty per-room sets are removed.
    pub fn remove_session(&self, room: &str, ssid: Option<&str>) {
        let mut data = self.lock();
        let emptied = match data.sessions.get_mut(room) {
            Some(set) => {
                match ssid {
                    Some(ssid) => {
                        set.remove(ssid);
                    }
                    None => set.clear(),
                }
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            data.sessions.remove(room);
        }
    }

    /// The session ids this user holds in `room`.
    pub fn session_ids(&self, room: &str) -> HashSet<String> {
        self.lock().sessions.get(room).cloned().unwrap_or_default()
    }

    /// Snapshot of the user's styles.
    pub fn styles(&self) -> Styles {
        self.lock().styles.clone()
    }

    /// Mutate the user's styles in place.
    pub fn update_styles<F: FnOnce(&mut Styles)>(&self, f: F) {
        f(&mut self.lock().styles);
    }

    /// Forget the cached profile blob so the next fetch re-reads it.
    pub fn clear_profile(&self) {
        self.lock().styles.profile = None;
    }

    pub(crate) fn merge(&self, attrs: &UserAttrs) {
        let mut data = self.lock();
        if let Some(is_anon) = attrs.is_anon {
            data.is_anon = is_anon;
        }
        if let Some(ref puid) = attrs.puid {
            if !puid.is_empty() {
                data.puid = puid.clone();
            }
        }
        // never clobber a known ip with an empty one
        if let Some(ref ip) = attrs.ip {
            if !ip.is_empty() {
                data.ip = Some(ip.clone());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UserData> {
        // contention here is incidental; poisoning means a handler panicked
        self.data.lock().expect("user record poisoned")
    }
}

impl PartialEq for User {
    fn eq(&self, other: &User) -> bool {
        self.name == other.name
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<User: {}>", self.name)
    }
}

/// Attributes supplied alongside a user reference in a protocol frame.
///
/// `None` means "not mentioned in this frame"; mentioned-but-empty values
/// never overwrite known ones.
#[derive(Debug, Default, Clone)]
pub struct UserAttrs {
    pub is_anon: Option<bool>,
    pub puid: Option<String>,
    pub ip: Option<String>,
}

/// The interning table. One record per lowercase name, for the life of the
/// process.
///
/// The global registry backs normal operation; tests construct their own so
/// runs don't see each other's users.
pub struct UserRegistry {
    users: Mutex<HashMap<String, User>>,
}

static GLOBAL: LazyLock<Arc<UserRegistry>> = LazyLock::new(|| Arc::new(UserRegistry::new()));

impl Default for UserRegistry {
    fn default() -> Self {
        UserRegistry::new()
    }
}

impl UserRegistry {
    pub fn new() -> UserRegistry {
        UserRegistry {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<UserRegistry> {
        GLOBAL.clone()
    }

    /// Fetch or create the record for `name`.
    pub fn intern(&self, name: &str) -> User {
        self.intern_with(name, UserAttrs::default())
    }

    /// Fetch or create the record for `name`, merging any supplied
    /// attributes into it.
    pub fn intern_with(&self, name: &str, attrs: UserAttrs) -> User {
        let key = name.to_lowercase();
        let user = {
            let mut users = self.users.lock().expect("user registry poisoned");
            users
                .entry(key)
                .or_insert_with(|| User::with_name(name))
                .clone()
        };
        user.merge(&attrs);
        user
    }

    /// Look up a record without creating one.
    pub fn get(&self, name: &str) -> Option<User> {
        self.users
            .lock()
            .expect("user registry poisoned")
            .get(&name.to_lowercase())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_record() {
        let registry = UserRegistry::new();
        let a = registry.intern("Alice");
        let b = registry.intern("alice");
        assert_eq!(a, b);
        assert_eq!(a.name(), "alice");
        assert_eq!(a.show_name(), "Alice");
    }

    #[test]
    fn merge_never_clobbers_known_ip_with_empty() {
        let registry = UserRegistry::new();
        let user = registry.intern_with(
            "bob",
            UserAttrs {
                ip: Some("1.2.3.4".to_owned()),
                ..UserAttrs::default()
            },
        );
        registry.intern_with(
            "bob",
            UserAttrs {
                ip: Some(String::new()),
                puid: Some("999".to_owned()),
                ..UserAttrs::default()
            },
        );
        assert_eq!(user.ip().as_deref(), Some("1.2.3.4"));
        assert_eq!(user.puid(), "999");
    }

    #[test]
    fn sessions_per_room() {
        let registry = UserRegistry::new();
        let user = registry.intern("carol");
        user.add_session("roomone", "S1");
        user.add_session("roomone", "S2");
        user.add_session("roomtwo", "S3");
        assert_eq!(user.session_ids("roomone").len(), 2);
        user.remove_session("roomone", Some("S1"));
        assert_eq!(user.session_ids("roomone").len(), 1);
        user.remove_session("roomone", None);
        assert!(user.session_ids("roomone").is_empty());
        assert_eq!(user.session_ids("roomtwo").len(), 1);
    }

    #[test]
    fn admin_mask() {
        let flags = ModeratorFlags::EDIT_GROUP | ModeratorFlags::SEE_IPS;
        assert!(flags.is_admin());
        assert!(!ModeratorFlags::SEE_IPS.is_admin());
        assert!(ModeratorFlags::from_bits_truncate(65535).is_admin());
    }
}
