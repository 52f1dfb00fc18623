//! Frame-driven end-to-end scenarios: a room is fed raw frames with no live
//! socket behind it (outbound sends are quiet no-ops while disconnected),
//! then its state and emitted events are checked.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chatango_tokio::{Error, Event, ModeratorFlags, Room, RoomFlags, UserRegistry};

fn fresh_room(name: &str) -> Room {
    Room::with_registry(name, Arc::new(UserRegistry::new())).unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[test]
fn construction_rejects_bad_names() {
    assert!(matches!(
        Room::with_registry("Bad Name!", Arc::new(UserRegistry::new())),
        Err(Error::InvalidRoomName(_))
    ));
}

#[test]
fn session_bootstrap() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("ok:ownerx:12345:M:testbot:1700000000.0:1.2.3.4:modx,65535:1");

    assert_eq!(room.owner().unwrap().name(), "ownerx");
    assert_eq!(room.user().unwrap().name(), "testbot");
    assert_eq!(room.flags(), RoomFlags::LIST_TAXONOMY);

    let mods = room.mods();
    let (modx, flags) = mods.iter().next().unwrap();
    assert_eq!(modx.name(), "modx");
    assert_eq!(*flags, ModeratorFlags::from_bits_truncate(65535));
    assert!(flags.is_admin());

    let expected = 1_700_000_000.0 - unix_now();
    assert!((room.time_correction() - expected).abs() < 5.0);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::Connect { room } if room == "testroom")));
}

#[test]
fn two_phase_delivery_payload_first() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("b:1700000001.0:alice::PUID1:UNID1:MID1:1.1.1.1:0:11:hi there");
    room.handle_command("u:MID1:FINAL1");

    let events = drain(&mut rx);
    let messages: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Message(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("FINAL1"));
    assert_eq!(messages[0].body, "hi there");
    assert_eq!(messages[0].user.name(), "alice");
    assert_eq!(room.message_by_id("FINAL1").unwrap().body, "hi there");
}

#[test]
fn two_phase_delivery_binding_first() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("u:MID1:FINAL1");
    room.handle_command("b:1700000001.0:alice::PUID1:UNID1:MID1:1.1.1.1:0:11:hello");

    let events = drain(&mut rx);
    let messages: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Message(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("FINAL1"));
    assert_eq!(messages[0].body, "hello");
}

#[test]
fn anon_join_lands_in_roster() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("participant:1:S1:P1:None:None:9.9.9.9:1700000002.0");

    let events = drain(&mut rx);
    let joined = events
        .iter()
        .find_map(|event| match event {
            Event::AnonJoin(user) => Some(user.clone()),
            _ => None,
        })
        .expect("an anon join event");
    assert!(joined.name().starts_with("anon"));
    assert!(joined.session_ids("testroom").contains("S1"));
    assert_eq!(room.anon_list().len(), 1);
}

#[test]
fn ban_records_the_target() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("blocked:UNID9:9.9.9.9:victim:modx:1700000003.0");

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Ban { by, target } if by.name() == "modx" && target.name() == "victim"
    )));
    let banned = room.ban_list();
    assert_eq!(banned.len(), 1);
    assert_eq!(banned[0].name(), "victim");
    let record = room.ban_record(&banned[0]).unwrap();
    assert_eq!(record.unid, "UNID9");
    assert_eq!(record.src.name(), "modx");
}

#[test]
fn denied_clears_the_reconnect_flag() {
    let mut room = fresh_room("testroom");
    let mut rx = room.subscribe();
    room.handle_command("denied");
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::RoomDenied(name) if name == "testroom")));
}

#[test]
fn shared_registry_interns_across_contexts() {
    // the same name seen as a mod and as a message author is one record
    let registry = Arc::new(UserRegistry::new());
    let mut room = Room::with_registry("testroom", registry.clone()).unwrap();
    room.handle_command("ok:ownerx:12345:M:testbot:1700000000.0:1.2.3.4:alice,2:1");
    room.handle_command("b:1700000001.0:alice::PUID1:UNID1:MID1:1.1.1.1:0:11:hi");
    room.handle_command("u:MID1:F1");

    let from_message = room.message_by_id("F1").unwrap().user.clone();
    assert!(room.mods().contains_key(&from_message));
    assert_eq!(registry.get("alice").unwrap(), from_message);
}
