use std::str::FromStr;

use thiserror::Error;

/// A parsed POP3 command (RFC 1939 plus CAPA/UIDL/TOP/STLS).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pop3Command {
    User(String),
    Pass(String),
    Apop { user: String, digest: String },
    Stat,
    List(Option<u32>),
    Uidl(Option<u32>),
    Retr(u32),
    Top(u32, u32),
    Dele(u32),
    Noop,
    Rset,
    Quit,
    Capa,
    Stls,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Pop3ParseError {
    #[error("empty command line")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("invalid arguments for {0}")]
    BadArguments(&'static str),
}

impl Pop3Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Apop { .. } => "APOP",
            Self::Stat => "STAT",
            Self::List(_) => "LIST",
            Self::Uidl(_) => "UIDL",
            Self::Retr(_) => "RETR",
            Self::Top(..) => "TOP",
            Self::Dele(_) => "DELE",
            Self::Noop => "NOOP",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
            Self::Capa => "CAPA",
            Self::Stls => "STLS",
        }
    }
}

/// Parse one command line, CRLF excluded or included.
pub fn parse_command(line: &[u8]) -> Result<Pop3Command, Pop3ParseError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let mut words = line.split(' ').filter(|w| !w.is_empty());
    let verb = words.next().ok_or(Pop3ParseError::Empty)?.to_uppercase();
    let args: Vec<&str> = words.collect();

    let msg_number = |name: &'static str, args: &[&str]| -> Result<u32, Pop3ParseError> {
        match args {
            [n] => u32::from_str(n)
                .ok()
                .filter(|v| *v != 0)
                .ok_or(Pop3ParseError::BadArguments(name)),
            _ => Err(Pop3ParseError::BadArguments(name)),
        }
    };
    let opt_msg_number = |name: &'static str, args: &[&str]| -> Result<Option<u32>, Pop3ParseError> {
        match args {
            [] => Ok(None),
            _ => msg_number(name, args).map(Some),
        }
    };

    match verb.as_str() {
        "USER" => match args.as_slice() {
            [user] => Ok(Pop3Command::User(user.to_string())),
            _ => Err(Pop3ParseError::BadArguments("USER")),
        },
        "PASS" => match args.as_slice() {
            // a password may contain spaces
            [] => Err(Pop3ParseError::BadArguments("PASS")),
            _ => Ok(Pop3Command::Pass(args.join(" "))),
        },
        "APOP" => match args.as_slice() {
            [user, digest] => Ok(Pop3Command::Apop {
                user: user.to_string(),
                digest: digest.to_lowercase(),
            }),
            _ => Err(Pop3ParseError::BadArguments("APOP")),
        },
        "STAT" => Ok(Pop3Command::Stat),
        "LIST" => opt_msg_number("LIST", &args).map(Pop3Command::List),
        "UIDL" => opt_msg_number("UIDL", &args).map(Pop3Command::Uidl),
        "RETR" => msg_number("RETR", &args).map(Pop3Command::Retr),
        "TOP" => match args.as_slice() {
            [n, lines] => {
                let n = msg_number("TOP", &[n])?;
                let lines =
                    u32::from_str(lines).map_err(|_| Pop3ParseError::BadArguments("TOP"))?;
                Ok(Pop3Command::Top(n, lines))
            }
            _ => Err(Pop3ParseError::BadArguments("TOP")),
        },
        "DELE" => msg_number("DELE", &args).map(Pop3Command::Dele),
        "NOOP" => Ok(Pop3Command::Noop),
        "RSET" => Ok(Pop3Command::Rset),
        "QUIT" => Ok(Pop3Command::Quit),
        "CAPA" => Ok(Pop3Command::Capa),
        "STLS" => Ok(Pop3Command::Stls),
        other => Err(Pop3ParseError::UnknownCommand(other.to_string())),
    }
}

pub fn ok(message: &str) -> Vec<u8> {
    format!("+OK {}\r\n", message).into_bytes()
}

pub fn err(message: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", message).into_bytes()
}

/// Byte-stuff a message body for transmission inside a multi-line response:
/// a leading `.` on any line is doubled, and the body is normalized to end
/// with CRLF so the terminating `.` always sits on its own line.
pub fn dot_stuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + 16);
    let mut at_line_start = true;
    for &b in src {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// The multi-line response terminator.
pub const TERMINATOR: &[u8] = b".\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_commands() {
        assert_eq!(
            parse_command(b"USER alice\r\n").unwrap(),
            Pop3Command::User("alice".to_string())
        );
        assert_eq!(
            parse_command(b"retr 3\r\n").unwrap(),
            Pop3Command::Retr(3)
        );
        assert_eq!(
            parse_command(b"TOP 2 10\r\n").unwrap(),
            Pop3Command::Top(2, 10)
        );
        assert_eq!(parse_command(b"UIDL\r\n").unwrap(), Pop3Command::Uidl(None));
        assert_eq!(
            parse_command(b"UIDL 7\r\n").unwrap(),
            Pop3Command::Uidl(Some(7))
        );
    }

    #[test]
    fn pass_keeps_embedded_spaces() {
        assert_eq!(
            parse_command(b"PASS corn horse battery\r\n").unwrap(),
            Pop3Command::Pass("corn horse battery".to_string())
        );
    }

    #[test]
    fn rejects_zero_and_missing_message_numbers() {
        assert_eq!(
            parse_command(b"RETR 0\r\n"),
            Err(Pop3ParseError::BadArguments("RETR"))
        );
        assert_eq!(
            parse_command(b"RETR\r\n"),
            Err(Pop3ParseError::BadArguments("RETR"))
        );
        assert!(matches!(
            parse_command(b"FROBNICATE\r\n"),
            Err(Pop3ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        let body = b"line one\r\n.hidden\r\n..already\r\ntail";
        let stuffed = dot_stuff(body);
        assert_eq!(
            stuffed,
            b"line one\r\n..hidden\r\n...already\r\ntail\r\n".to_vec()
        );
    }
}
