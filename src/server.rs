//! Maps a room name to the shard server that hosts it.
//!
//! Resolution is: the historical special-case table, then the digest table,
//! then a weighted bucket walk over the shard weight table. The walk order
//! and the `<=` tie-break both matter; they mirror what the live service
//! does, so a different ordering joins the wrong server.

use crate::hasher::chatango_digest;

/// Rooms that were pinned to a shard before the weighted table existed.
#[rustfmt::skip]
static SPECIALS: &[(&str, u16)] = &[
    ("mitvcanal", 56), ("animeultimacom", 34), ("cricket365live", 21),
    ("pokemonepisodeorg", 22), ("animelinkz", 20), ("sport24lt", 56),
    ("narutowire", 10), ("watchanimeonn", 22), ("cricvid-hitcric-", 51),
    ("narutochatt", 70), ("leeplarp", 27), ("stream2watch3", 56),
    ("ttvsports", 56), ("ver-anime", 8), ("vipstand", 21),
    ("eafangames", 56), ("soccerjumbo", 21), ("myfoxdfw", 67),
    ("kiiiikiii", 21), ("de-livechat", 5), ("rgsmotrisport", 51),
    ("dbzepisodeorg", 10), ("watch-dragonball", 8), ("peliculas-flv", 69),
    ("tvanimefreak", 54), ("tvtvanimefreak", 54),
];

/// Digest-pinned rooms. Entries appear as the service moves rooms onto
/// dedicated shards; none are currently known.
static DIGEST_SHARDS: &[(&str, u16)] = &[];

/// Shard numbers and their relative weights, in walk order.
#[rustfmt::skip]
static TS_WEIGHTS: &[(u16, u32)] = &[
    (5, 75), (6, 75), (7, 75), (8, 75), (16, 75),
    (17, 75), (18, 75), (9, 95), (11, 95), (12, 95),
    (13, 95), (14, 95), (15, 95), (19, 110), (23, 110),
    (24, 110), (25, 110), (26, 110), (28, 104), (29, 104),
    (30, 104), (31, 104), (32, 104), (33, 104), (35, 101),
    (36, 101), (37, 101), (38, 101), (39, 101), (40, 101),
    (41, 101), (42, 101), (43, 101), (44, 101), (45, 101),
    (46, 101), (47, 101), (48, 101), (49, 101), (50, 101),
    (52, 110), (53, 110), (55, 110), (57, 110),
    (58, 110), (59, 110), (60, 110), (61, 110),
    (62, 110), (63, 110), (64, 110), (65, 110),
    (66, 110), (68, 95), (71, 116), (72, 116),
    (73, 116), (74, 116), (75, 116), (76, 116),
    (77, 116), (78, 116), (79, 116), (80, 116),
    (81, 116), (82, 116), (83, 116), (84, 116),
];

/// Resolve the server host for a room.
pub fn get_server(group: &str) -> String {
    format!("s{}.chatango.com", shard_number(group))
}

fn shard_number(group: &str) -> u16 {
    if let Some(&(_, shard)) = SPECIALS.iter().find(|&&(name, _)| name == group) {
        return shard;
    }

    let digest = chatango_digest(group);
    if let Some(&(_, shard)) = DIGEST_SHARDS.iter().find(|&&(hex, _)| hex == digest) {
        return shard;
    }

    let group = group.replace(['_', '-'], "q");
    let prefix: String = group.chars().take(5).collect();
    let fnv = u64::from_str_radix(&prefix, 36).unwrap_or(0);
    let tail: String = group.chars().skip(6).take(3).collect();
    let lnv = if tail.is_empty() {
        1000
    } else {
        u64::from_str_radix(&tail, 36)
            .map(|n| n.max(1000))
            .unwrap_or(1000)
    };
    let num = (fnv % lnv) as f64 / lnv as f64;

    let total: u32 = TS_WEIGHTS.iter().map(|&(_, weight)| weight).sum();
    let mut cumfreq = 0.0;
    for &(shard, weight) in TS_WEIGHTS {
        cumfreq += f64::from(weight) / f64::from(total);
        if num <= cumfreq {
            return shard;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_fallback_fixtures() {
        assert_eq!(get_server("pythonrpg"), "s58.chatango.com");
        assert_eq!(get_server("a"), "s5.chatango.com");
        assert_eq!(get_server("test-room"), "s25.chatango.com");
        assert_eq!(get_server("examplegroup"), "s23.chatango.com");
        assert_eq!(get_server("a1"), "s37.chatango.com");
        assert_eq!(get_server("zzzzzzzzzzzzzzzzzzzz"), "s7.chatango.com");
    }

    #[test]
    fn special_names_bypass_the_walk() {
        assert_eq!(get_server("kiiiikiii"), "s21.chatango.com");
        assert_eq!(get_server("de-livechat"), "s5.chatango.com");
        assert_eq!(get_server("tvtvanimefreak"), "s54.chatango.com");
    }

    #[test]
    fn totality_over_the_name_alphabet() {
        let known: Vec<u16> = TS_WEIGHTS.iter().map(|&(shard, _)| shard).collect();
        let alphabet: Vec<char> = ('a'..='z').chain('0'..='9').chain(['-']).collect();
        for a in &alphabet {
            for b in &alphabet {
                let name = format!("{}{}{}{}{}{}{}", a, b, a, b, a, b, a);
                if SPECIALS.iter().any(|&(special, _)| special == name) {
                    continue;
                }
                let host = get_server(&name);
                let shard: u16 = host
                    .strip_prefix('s')
                    .and_then(|rest| rest.strip_suffix(".chatango.com"))
                    .and_then(|digits| digits.parse().ok())
                    .unwrap();
                assert!(known.contains(&shard), "{} resolved to {}", name, host);
            }
        }
    }
}
