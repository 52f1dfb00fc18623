//! The private-message endpoint.
//!
//! PM sessions reuse the room connection core (the framing, the ping
//! cadence, the reconnect discipline) with a different command vocabulary:
//! a token login instead of `bauth`, and single-phase message delivery.
//! Rooms are the canonical case; only the shared surface lives here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::connection::{Connection, FrameReader};
use crate::event::{Event, EventBus};
use crate::model::{
    clean_message, parse_font, Channel, Message, MessageFlags, User, UserRegistry,
};
use crate::{rest, wire, Error, Result};

const PM_HOST: &str = "c1.chatango.com";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// The name PM messages carry in their channel, standing in for a room.
pub const PM_NAME: &str = "<PM>";

/// A PM session.
pub struct Pm {
    conn: Connection,
    events: EventBus,
    registry: Arc<UserRegistry>,
    pub(crate) reconnect: bool,
    self_user: Option<User>,
    time_correction: f64,
    connected_once: bool,
}

impl Pm {
    pub fn new() -> Pm {
        Pm::with_registry(UserRegistry::global())
    }

    pub fn with_registry(registry: Arc<UserRegistry>) -> Pm {
        Pm {
            conn: Connection::new(),
            events: EventBus::new(),
            registry,
            reconnect: false,
            self_user: None,
            time_correction: 0.0,
            connected_once: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Whether the server has acknowledged the session at least once.
    pub fn has_connected(&self) -> bool {
        self.connected_once
    }

    /// Subscribe to this session's events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    /// Log in over HTTP for the token and open the socket.
    pub async fn connect(&mut self, user_name: &str, password: &str) -> Result<FrameReader> {
        if self.conn.is_connected() {
            return Err(Error::AlreadyConnected(PM_NAME.to_owned()));
        }
        let token = rest::get_token(user_name, password)
            .await?
            .ok_or(Error::Protocol("PM login rejected"))?;
        let reader = self.conn.connect(PM_HOST, self.events.clone()).await?;
        self.conn.send(&["tlogin", &token, "2"]);
        self.self_user = Some(self.registry.intern(user_name));
        Ok(reader)
    }

    /// Stay on the PM connection, redialing on drops when asked to.
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
                    error!("could not connect to PM server: {}", err);
                }
            }
            if !self.reconnect {
                return Ok(());
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    pub fn disconnect(&mut self) {
        self.reconnect = false;
        self.conn.disconnect();
    }

    pub(crate) fn handle_disconnect(&mut self) {
        self.conn.disconnect();
        self.events.emit(Event::Disconnect {
            room: PM_NAME.to_owned(),
        });
    }

    /// Route one inbound PM frame, mirroring the room dispatcher.
    pub fn handle_command(&mut self, frame: &str) {
        if frame.is_empty() {
            return;
        }
        let (verb, args) = wire::split_command(frame);
        let result = match verb {
            "OK" => self.rcmd_ok(&args),
            "DENIED" => self.rcmd_denied(&args),
            "time" => self.rcmd_time(&args),
            "msg" => self.rcmd_msg(&args),
            "msgoff" => self.rcmd_msg(&args),
            "pong" => {
                self.events.emit(Event::Pong);
                Ok(())
            }
            _ => {
                debug!("unhandled PM command `{}`", verb);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!("error while handling PM command `{}`: {}", verb, err);
        }
    }

    fn rcmd_ok(&mut self, _args: &[&str]) -> Result<()> {
        self.connected_once = true;
        self.events.emit(Event::Connect {
            room: PM_NAME.to_owned(),
        });
        Ok(())
    }

    fn rcmd_denied(&mut self, _args: &[&str]) -> Result<()> {
        self.reconnect = false;
        self.conn.disconnect();
        self.events.emit(Event::RoomDenied(PM_NAME.to_owned()));
        Ok(())
    }

    fn rcmd_time(&mut self, args: &[&str]) -> Result<()> {
        let server_time: f64 = args
            .first()
            .and_then(|raw| raw.parse().ok())
            .ok_or(Error::Malformed("time frame"))?;
        self.time_correction = server_time - unix_now();
        Ok(())
    }

    /// Single-phase message delivery; PMs have no temp/final id pairing.
    fn rcmd_msg(&mut self, args: &[&str]) -> Result<()> {
        if args.len() < 6 {
            return Err(Error::Malformed("PM message frame"));
        }
        let name = [args[0], args[1], args[2]]
            .into_iter()
            .find(|candidate| !candidate.is_empty())
            .ok_or(Error::Malformed("PM message sender"))?;
        let time = args[3]
            .parse::<f64>()
            .map_err(|_| Error::Malformed("PM message time"))?
            - self.time_correction;
        let raw = wire::rejoin(args, 5);
        let (body, name_tag, font_tag) = clean_message(&raw, true);

        let user = self.registry.intern(name);
        if !name_tag.is_empty() {
            user.update_styles(|styles| styles.name_color = name_tag);
        }
        if !font_tag.is_empty() {
            let font = parse_font(font_tag.trim());
            user.update_styles(|styles| {
                styles.font_size = font.size;
                styles.font_color = font.color;
                styles.font_face = font.face;
            });
        }

        let msg = Message {
            id: None,
            temp_id: String::new(),
            user: user.clone(),
            time,
            ip: String::new(),
            puid: String::new(),
            unid: String::new(),
            body,
            raw,
            flags: MessageFlags::empty(),
            mentions: Vec::new(),
            channel: Channel {
                room: PM_NAME.to_owned(),
                user,
            },
        };
        self.events.emit(Event::Message(Arc::new(msg)));
        Ok(())
    }

    /// Send a private message.
    pub fn send_message(&self, to: &str, text: &str) {
        let styles = self
            .self_user
            .as_ref()
            .map(|user| user.styles())
            .unwrap_or_default();
        let body = format!(
            "<n{}/><m v=\"1\"><g x{}s{}=\"{}\">{}</g></m>",
            styles.name_color,
            styles.font_size,
            styles.font_color,
            styles.font_face,
            text.replace('\n', "\r"),
        );
        self.conn.send(&["msg", to, &body]);
    }
}

impl Default for Pm {
    fn default() -> Pm {
        Pm::new()
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pm_messages_are_single_phase() {
        let mut pm = Pm::with_registry(Arc::new(UserRegistry::new()));
        let mut rx = pm.subscribe();
        pm.handle_command("msg:friend:::1700000001.0:0:<n900/><g x11553399=\"8\">hello:there");
        let event = rx.try_recv().unwrap();
        match event {
            Event::Message(msg) => {
                assert_eq!(msg.user.name(), "friend");
                assert_eq!(msg.body, "hello:there");
                assert_eq!(msg.channel.room, PM_NAME);
            }
            other => panic!("expected a message event, got {:?}", other),
        }
    }

    #[test]
    fn denied_stops_reconnecting() {
        let mut pm = Pm::with_registry(Arc::new(UserRegistry::new()));
        pm.reconnect = true;
        let mut rx = pm.subscribe();
        pm.handle_command("DENIED");
        assert!(!pm.reconnect);
        assert!(matches!(rx.try_recv(), Ok(Event::RoomDenied(_))));
    }
}
