//! Resolver and digest fixtures pinned against the live service's behavior.

use chatango_tokio::{anon_name, chatango_digest, get_server};

#[test]
fn room_resolves_to_its_shard() {
    assert_eq!(get_server("pythonrpg"), "s58.chatango.com");
}

#[test]
fn special_rooms_resolve_to_their_pinned_shards() {
    assert_eq!(get_server("narutochatt"), "s70.chatango.com");
    assert_eq!(get_server("peliculas-flv"), "s69.chatango.com");
}

#[test]
fn resolver_is_total_over_valid_names() {
    // a spread of name shapes: short, long, digit-heavy, dash-heavy
    let names = [
        "a",
        "zz",
        "room",
        "a-b-c-d-e-f",
        "0123456789",
        "x9",
        "qqqqqqqqqqqqqqqqqqqq",
        "chat-2024",
    ];
    for name in names {
        let host = get_server(name);
        let shard: u16 = host
            .strip_prefix('s')
            .and_then(|rest| rest.strip_suffix(".chatango.com"))
            .and_then(|digits| digits.parse().ok())
            .unwrap_or_else(|| panic!("{} resolved to malformed host {}", name, host));
        assert!((5..=84).contains(&shard), "{} -> {}", name, host);
    }
}

#[test]
fn digest_matches_recorded_vectors() {
    assert_eq!(
        chatango_digest("pythonrpg"),
        "eaca4ae562b09f56375d052478a334dd"
    );
    assert_eq!(chatango_digest("test"), "392235e102c244b49edd9796d2efb59c");
}

#[test]
fn anon_names_are_digit_sums() {
    assert_eq!(anon_name("1700000002.0", "12345678"), "anon5670");
    for (ts, puid) in [
        ("1700000002.0", "12345678"),
        ("1234", "98765432"),
        ("9999.125", "00001111"),
    ] {
        let name = anon_name(ts, puid);
        assert!(name.starts_with("anon"));
        assert_eq!(name.len(), 8);
        // digit-wise: last four of the timestamp + middle four of the puid
        let ts_digits: Vec<u32> = ts
            .split('.')
            .next()
            .unwrap()
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .filter_map(|c| c.to_digit(10))
            .collect();
        let puid_digits: Vec<u32> = format!("{:0>8}", puid)
            .chars()
            .skip(4)
            .take(4)
            .filter_map(|c| c.to_digit(10))
            .collect();
        let expected: String = puid_digits
            .iter()
            .zip(ts_digits.iter())
            .map(|(p, t)| char::from_digit((p + t) % 10, 10).unwrap())
            .collect();
        assert_eq!(&name[4..], expected);
    }
}
