/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The line protocol spoken between peers.
//!
//! Every command occupies one newline-terminated ASCII line, chosen so
//! the protocol can be exercised by hand with `nc`. Lines starting
//! with `#` are comments: ignored by peers, surfaced to logs. For the
//! commands of the original verb set the first character suffices for
//! dispatch; the membership verbs (`resize`, `remove`, `done`) are
//! matched as full words.
//!
//! Element payloads travel as `data <len> (seq:index) <hex>...` with
//! one element per line; the `(seq:index)` tag lets the receiver
//! assert that each element arrives at the expected traversal
//! position.

use enum_as_inner::EnumAsInner;

use crate::error::Error;
use crate::error::Result;

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner)]
pub enum Command {
    /// `register <location> <host> <port>`: request an ID from home.
    Register {
        /// Unique location string of the registrant.
        location: String,
        /// Host the registrant listens on.
        host: String,
        /// Port the registrant listens on.
        port: u16,
    },
    /// `id <lid> <location> <host> <port>`: announce a peer. Only
    /// home may originate these.
    Id {
        /// Assigned location-ID.
        lid: i32,
        /// Location string of the peer.
        location: String,
        /// Host the peer listens on.
        host: String,
        /// Port the peer listens on.
        port: u16,
    },
    /// `myid <lid>`: identify self after re-connecting.
    MyId {
        /// The sender's location-ID.
        lid: i32,
    },
    /// `phase <phaseid>`: home announces the compute phase.
    Phase {
        /// Phase number.
        phase: i32,
    },
    /// `allowsend <count> <elemsize>`: receiver grants send credit.
    AllowSend {
        /// Elements the peer may send.
        count: u64,
        /// Expected bytes per element.
        elemsize: usize,
    },
    /// `data <len> (seq:index) <hex>...`: one element of payload.
    Data {
        /// Payload byte length.
        len: usize,
        /// Optional traversal position: sequence number and index.
        pos: Option<(u64, String)>,
        /// The element bytes.
        bytes: Vec<u8>,
    },
    /// `resize <phaseid> <maxid> [leave]`: a peer reports the phase
    /// boundary and, optionally, its departure.
    Resize {
        /// Phase the sender reached.
        phase: i32,
        /// Highest location-ID the sender has seen.
        maxid: i32,
        /// True when the sender wants to depart.
        leave: bool,
    },
    /// `remove <lid>`: home announces a departed peer.
    Remove {
        /// Location-ID leaving the world.
        lid: i32,
    },
    /// `done`: home finished a resize burst.
    Done,
    /// `help`: request usage text (interactive).
    Help,
    /// `status`: request peer table dump (interactive).
    Status,
    /// `quit`: close this connection (interactive).
    Quit,
    /// `kill`: ask the process to terminate (interactive).
    Kill,
    /// `# ...`: a comment line.
    Comment(String),
}

fn protocol_err(line: &str, why: &str) -> Error {
    Error::Protocol {
        lid: -1,
        reason: format!("{why} in '{line}'"),
    }
}

fn arg<'a, T: std::str::FromStr>(
    line: &str,
    parts: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<T> {
    parts
        .next()
        .ok_or_else(|| protocol_err(line, &format!("missing {what}")))?
        .parse()
        .map_err(|_| protocol_err(line, &format!("bad {what}")))
}

impl Command {
    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim_end_matches('\r').trim();
        if let Some(rest) = line.strip_prefix('#') {
            return Ok(Command::Comment(rest.trim().to_string()));
        }
        let mut parts = line.split_ascii_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| protocol_err(line, "empty command"))?;
        match verb {
            "resize" => Ok(Command::Resize {
                phase: arg(line, &mut parts, "phase")?,
                maxid: arg(line, &mut parts, "maxid")?,
                leave: parts.next() == Some("leave"),
            }),
            "remove" => Ok(Command::Remove {
                lid: arg(line, &mut parts, "lid")?,
            }),
            "done" => Ok(Command::Done),
            _ => match verb.as_bytes()[0] {
                b'r' => Ok(Command::Register {
                    location: arg(line, &mut parts, "location")?,
                    host: arg(line, &mut parts, "host")?,
                    port: arg(line, &mut parts, "port")?,
                }),
                b'i' => Ok(Command::Id {
                    lid: arg(line, &mut parts, "lid")?,
                    location: arg(line, &mut parts, "location")?,
                    host: arg(line, &mut parts, "host")?,
                    port: arg(line, &mut parts, "port")?,
                }),
                b'm' => Ok(Command::MyId {
                    lid: arg(line, &mut parts, "lid")?,
                }),
                b'p' => Ok(Command::Phase {
                    phase: arg(line, &mut parts, "phase")?,
                }),
                b'a' => Ok(Command::AllowSend {
                    count: arg(line, &mut parts, "count")?,
                    elemsize: arg(line, &mut parts, "elemsize")?,
                }),
                b'd' => parse_data(line, parts),
                b'h' => Ok(Command::Help),
                b's' => Ok(Command::Status),
                b'q' => Ok(Command::Quit),
                b'k' => Ok(Command::Kill),
                _ => Err(protocol_err(line, "unknown verb")),
            },
        }
    }

    /// Render the command as one protocol line (without newline).
    pub fn render(&self) -> String {
        match self {
            Command::Register {
                location,
                host,
                port,
            } => format!("register {location} {host} {port}"),
            Command::Id {
                lid,
                location,
                host,
                port,
            } => format!("id {lid} {location} {host} {port}"),
            Command::MyId { lid } => format!("myid {lid}"),
            Command::Phase { phase } => format!("phase {phase}"),
            Command::AllowSend { count, elemsize } => {
                format!("allowsend {count} {elemsize}")
            }
            Command::Data { len, pos, bytes } => {
                let mut out = format!("data {len}");
                if let Some((seq, idx)) = pos {
                    out.push_str(&format!(" ({seq}:{idx})"));
                }
                for b in bytes {
                    out.push_str(&format!(" {b:02x}"));
                }
                out
            }
            Command::Resize {
                phase,
                maxid,
                leave,
            } => {
                if *leave {
                    format!("resize {phase} {maxid} leave")
                } else {
                    format!("resize {phase} {maxid}")
                }
            }
            Command::Remove { lid } => format!("remove {lid}"),
            Command::Done => "done".to_string(),
            Command::Help => "help".to_string(),
            Command::Status => "status".to_string(),
            Command::Quit => "quit".to_string(),
            Command::Kill => "kill".to_string(),
            Command::Comment(text) => format!("# {text}"),
        }
    }
}

fn parse_data<'a>(line: &str, mut parts: impl Iterator<Item = &'a str>) -> Result<Command> {
    let len: usize = arg(line, &mut parts, "len")?;
    let mut pos = None;
    let mut bytes = Vec::with_capacity(len);
    for token in parts {
        if let Some(tag) = token.strip_prefix('(') {
            let tag = tag
                .strip_suffix(')')
                .ok_or_else(|| protocol_err(line, "unterminated position tag"))?;
            let (seq, idx) = tag
                .split_once(':')
                .ok_or_else(|| protocol_err(line, "bad position tag"))?;
            let seq = seq
                .parse()
                .map_err(|_| protocol_err(line, "bad position sequence"))?;
            pos = Some((seq, idx.to_string()));
            continue;
        }
        let b = u8::from_str_radix(token, 16)
            .map_err(|_| protocol_err(line, "bad hex byte"))?;
        bytes.push(b);
    }
    if bytes.len() != len {
        return Err(protocol_err(
            line,
            &format!("{} payload bytes, header says {len}", bytes.len()),
        ));
    }
    Ok(Command::Data { len, pos, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_core_verbs() {
        let cmds = vec![
            Command::Register {
                location: "host:12".to_string(),
                host: "host".to_string(),
                port: 7777,
            },
            Command::Id {
                lid: 2,
                location: "a:1".to_string(),
                host: "a".to_string(),
                port: 9000,
            },
            Command::MyId { lid: 3 },
            Command::Phase { phase: 0 },
            Command::AllowSend {
                count: 4,
                elemsize: 8,
            },
            Command::Resize {
                phase: 1,
                maxid: 2,
                leave: true,
            },
            Command::Remove { lid: 1 },
            Command::Done,
        ];
        for cmd in cmds {
            assert_eq!(Command::parse(&cmd.render()).unwrap(), cmd, "{cmd:?}");
        }
    }

    #[test]
    fn test_data_line() {
        let cmd = Command::Data {
            len: 2,
            pos: Some((3, "4/1".to_string())),
            bytes: vec![0xab, 0x01],
        };
        let line = cmd.render();
        assert_eq!(line, "data 2 (3:4/1) ab 01");
        assert_eq!(Command::parse(&line).unwrap(), cmd);

        // position tag is optional
        let bare = Command::parse("data 1 ff").unwrap();
        let (len, pos, bytes) = bare.as_data().unwrap();
        assert_eq!((*len, pos.is_none(), bytes.as_slice()), (1, true, &[0xffu8][..]));
    }

    #[test]
    fn test_single_letter_dispatch() {
        assert_eq!(Command::parse("h").unwrap(), Command::Help);
        assert_eq!(Command::parse("s").unwrap(), Command::Status);
        assert_eq!(Command::parse("q").unwrap(), Command::Quit);
        assert_eq!(Command::parse("k").unwrap(), Command::Kill);
    }

    #[test]
    fn test_comments_and_telnet_cr() {
        assert_eq!(
            Command::parse("# hello there").unwrap(),
            Command::Comment("hello there".to_string())
        );
        assert_eq!(Command::parse("phase 2\r").unwrap(), Command::Phase { phase: 2 });
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("x 1 2").is_err());
        assert!(Command::parse("allowsend four 8").is_err());
        assert!(Command::parse("data 2 ff").is_err());
        assert!(Command::parse("data 1 zz").is_err());
    }
}
