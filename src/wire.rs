//! Framing for the colon-delimited line protocol.
//!
//! Outbound commands are `verb:arg1:arg2...` terminated with `\r\n\0`. The
//! keep-alive ping is the bare terminator. Inbound websocket text frames
//! arrive already split by the transport; parsing is a single partition on
//! the first `:`. Bodies that contain `:` themselves are rejoined by the
//! handler that knows the field layout.

/// Terminator appended to every outbound command.
pub const TERMINATOR: &str = "\r\n\0";

/// The keep-alive frame: a terminator with no command in front of it.
pub const PING: &str = "\r\n\0";

/// Frame an outbound command.
pub fn frame(args: &[&str]) -> String {
    let mut out = args.join(":");
    out.push_str(TERMINATOR);
    out
}

/// Split an inbound frame into its verb and positional arguments.
pub fn split_command(line: &str) -> (&str, Vec<&str>) {
    match line.split_once(':') {
        Some((verb, rest)) => (verb, rest.split(':').collect()),
        None => (line, Vec::new()),
    }
}

/// Rejoin the tail of an argument list that was split through a `:`-bearing
/// body, starting at `index`.
pub fn rejoin(args: &[&str], index: usize) -> String {
    if index >= args.len() {
        String::new()
    } else {
        args[index..].join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_terminated() {
        assert_eq!(frame(&["bauth", "room", "123", "user", "pw"]), "bauth:room:123:user:pw\r\n\0");
        assert_eq!(frame(&["blogout"]), "blogout\r\n\0");
    }

    #[test]
    fn ping_is_a_bare_terminator() {
        assert_eq!(PING, "\r\n\0");
    }

    #[test]
    fn splits_on_the_first_colon_only() {
        let (verb, args) = split_command("b:123:alice::PUID:UNID:MID:ip:0:9:hi:there");
        assert_eq!(verb, "b");
        assert_eq!(args[1], "alice");
        assert_eq!(rejoin(&args, 9), "hi:there");
    }

    #[test]
    fn verb_without_arguments() {
        let (verb, args) = split_command("inited");
        assert_eq!(verb, "inited");
        assert!(args.is_empty());
    }
}
