//! The top-level client: owns a set of rooms and an optional PM session and
//! supervises their lifetimes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::event::{Event, EventBus};
use crate::model::UserRegistry;
use crate::pm::{Pm, PM_NAME};
use crate::room::Room;
use crate::{Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// How long `run` waits for every initial room to report in.
const START_TIMEOUT: Duration = Duration::from_secs(5);

struct RoomHandle {
    room: Arc<Mutex<Room>>,
    task: JoinHandle<()>,
}

struct PmHandle {
    pm: Arc<Mutex<Pm>>,
    task: JoinHandle<()>,
}

/// A Chatango client.
///
/// Each joined room runs in its own supervised task; the client merges
/// every room's events into one stream, tagged with the room name. Room
/// handles stay available for sending.
pub struct Client {
    username: String,
    password: String,
    registry: Arc<UserRegistry>,
    events: EventBus,
    rooms: HashMap<String, RoomHandle>,
    pm: Option<PmHandle>,
    merged_tx: mpsc::UnboundedSender<(String, Event)>,
    merged_rx: mpsc::UnboundedReceiver<(String, Event)>,
}

impl Client {
    pub fn new(username: &str, password: &str) -> Client {
        Client::with_registry(username, password, UserRegistry::global())
    }

    pub fn with_registry(username: &str, password: &str, registry: Arc<UserRegistry>) -> Client {
        let (merged_tx, merged_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        Client {
            username: username.to_owned(),
            password: password.to_owned(),
            registry,
            events,
            rooms: HashMap::new(),
            pm: None,
            merged_tx,
            merged_rx,
        }
    }

    /// Subscribe to the client's own lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Client lifecycle events go to both the client bus and the merged
    /// stream, tagged as coming from "client".
    fn emit_client(&self, event: Event) {
        self.events.emit(event.clone());
        let _ = self.merged_tx.send(("client".to_owned(), event));
    }

    /// The next event from any owned room, the PM session or the client,
    /// tagged with its source.
    pub async fn next_event(&mut self) -> Option<(String, Event)> {
        self.merged_rx.recv().await
    }

    /// Names of the rooms currently owned.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Handle to a joined room, for sending and state queries.
    pub fn room(&self, name: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.get(name).map(|handle| handle.room.clone())
    }

    /// Handle to the PM session, if one was started.
    pub fn pm(&self) -> Option<Arc<Mutex<Pm>>> {
        self.pm.as_ref().map(|handle| handle.pm.clone())
    }

    /// Join a room and keep it connected in a background task.
    pub fn join_room(&mut self, name: &str) -> Result<()> {
        Room::validate_name(name)?;
        if self.rooms.contains_key(name) {
            warn!("already joined room {}", name);
            return Ok(());
        }
        let room = Room::with_registry(name, self.registry.clone())?;
        forward(room.event_bus(), name, self.merged_tx.clone());

        let room = Arc::new(Mutex::new(room));
        let task = tokio::spawn(supervise_room(
            room.clone(),
            self.username.clone(),
            self.password.clone(),
        ));
        self.rooms
            .insert(name.to_owned(), RoomHandle { room, task });
        Ok(())
    }

    /// Disconnect a room and drop its supervision.
    pub async fn leave_room(&mut self, name: &str) {
        if let Some(handle) = self.rooms.remove(name) {
            handle.room.lock().await.disconnect();
            handle.task.abort();
        }
    }

    /// Begin a PM session with the configured credentials.
    pub fn join_pm(&mut self) {
        if self.pm.is_some() {
            return;
        }
        if self.username.is_empty() || self.password.is_empty() {
            error!("PM requires a username and password");
            return;
        }
        let pm = Pm::with_registry(self.registry.clone());
        forward(pm.event_bus(), PM_NAME, self.merged_tx.clone());
        let pm = Arc::new(Mutex::new(pm));
        let task = tokio::spawn(supervise_pm(
            pm.clone(),
            self.username.clone(),
            self.password.clone(),
        ));
        self.pm = Some(PmHandle { pm, task });
    }

    /// Disconnect the PM session.
    pub async fn leave_pm(&mut self) {
        if let Some(handle) = self.pm.take() {
            handle.pm.lock().await.disconnect();
            handle.task.abort();
        }
    }

    /// Start up: join every initial room (and the PM when asked), then wait
    /// up to the start deadline for them to report in. Rooms that never
    /// connect are logged; the client still counts as started.
    pub async fn run(&mut self, initial_rooms: &[&str], use_pm: bool) -> Result<()> {
        self.emit_client(Event::Init);
        if !use_pm && initial_rooms.is_empty() {
            return Err(Error::Other("no rooms or PM to join"));
        }
        if use_pm {
            self.join_pm();
        }
        for name in initial_rooms {
            self.join_room(name)?;
        }

        let started = Instant::now();
        loop {
            let mut pending = Vec::new();
            for (name, handle) in &self.rooms {
                if !handle.room.lock().await.has_connected() {
                    pending.push(name.clone());
                }
            }
            if pending.is_empty() {
                break;
            }
            if started.elapsed() >= START_TIMEOUT {
                warn!("rooms never connected: {}", pending.join(", "));
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.emit_client(Event::Started);
        Ok(())
    }

    /// Disconnect everything.
    pub async fn stop(&mut self) {
        let names = self.room_names();
        for name in names {
            self.leave_room(&name).await;
        }
        self.leave_pm().await;
    }

    /// Toggle message backgrounds in every owned room.
    pub async fn set_bg(&self, active: bool) {
        for handle in self.rooms.values() {
            handle.room.lock().await.set_bg_mode(u32::from(active));
        }
    }
}

/// Pump one bus into the merged client stream. Lagged subscriptions skip
/// ahead rather than stopping.
fn forward(bus: EventBus, source: &str, tx: mpsc::UnboundedSender<(String, Event)>) {
    let source = source.to_owned();
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send((source.clone(), event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event forwarding for {} lagged by {}", source, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// The listen loop for a client-owned room: redial on drops with a fixed
/// delay, holding the room lock only while handling a frame so callers can
/// keep sending.
async fn supervise_room(room: Arc<Mutex<Room>>, username: String, password: String) {
    {
        room.lock().await.reconnect = true;
    }
    loop {
        let connected = {
            let mut guard = room.lock().await;
            guard.connect(&username, &password).await
        };
        match connected {
            Ok(mut reader) => {
                while let Some(frame) = reader.next().await {
                    room.lock().await.handle_command(&frame);
                }
                room.lock().await.handle_disconnect();
            }
            Err(err @ Error::AlreadyConnected(_)) => {
                error!("room supervision clash: {}", err);
                return;
            }
            Err(err) => {
                error!("room connect failed: {}", err);
            }
        }
        if !room.lock().await.reconnect {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn supervise_pm(pm: Arc<Mutex<Pm>>, username: String, password: String) {
    {
        pm.lock().await.reconnect = true;
    }
    loop {
        let connected = {
            let mut guard = pm.lock().await;
            guard.connect(&username, &password).await
        };
        match connected {
            Ok(mut reader) => {
                while let Some(frame) = reader.next().await {
                    pm.lock().await.handle_command(&frame);
                }
                pm.lock().await.handle_disconnect();
            }
            Err(err @ Error::AlreadyConnected(_)) => {
                error!("PM supervision clash: {}", err);
                return;
            }
            Err(err) => {
                error!("PM connect failed: {}", err);
            }
        }
        if !pm.lock().await.reconnect {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
