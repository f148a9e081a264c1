use std::str::from_utf8;

use chrono::{DateTime, FixedOffset, NaiveDate};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take, take_while1},
    character::complete::digit1,
    combinator::{map, map_res, opt, value},
    multi::{many1, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use crate::imap::search::SearchKey;
use crate::imap::sequence::SequenceSet;
use crate::imap::types::*;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("syntax error near {near:?}")]
    Syntax { near: String },
}

/// Parse one complete wire command: a line with its literals already
/// inlined by the framer, terminated by CRLF.
pub fn parse_command(input: &[u8]) -> Result<Command, ParseError> {
    match command(input) {
        Ok((rest, cmd)) if rest.is_empty() => Ok(cmd),
        Ok((rest, _)) => Err(ParseError::Syntax {
            near: String::from_utf8_lossy(&rest[..rest.len().min(32)]).into_owned(),
        }),
        Err(_) => Err(ParseError::Syntax {
            near: String::from_utf8_lossy(&input[..input.len().min(32)]).into_owned(),
        }),
    }
}

// ----- terminals -----

fn sp(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b" ")(input)
}

fn crlf(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b"\r\n")(input)
}

/// ATOM-CHAR = <any CHAR except atom-specials>
fn is_atom_char(b: u8) -> bool {
    matches!(b, 0x21..=0x7e)
        && !matches!(b, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
}

/// ASTRING-CHAR = ATOM-CHAR / resp-specials
fn is_astring_char(b: u8) -> bool {
    is_atom_char(b) || b == b']'
}

fn is_tag_char(b: u8) -> bool {
    is_astring_char(b) && b != b'+'
}

fn atom(input: &[u8]) -> IResult<&[u8], &str> {
    map_res(take_while1(is_atom_char), from_utf8)(input)
}

fn atom_string(input: &[u8]) -> IResult<&[u8], String> {
    map(atom, str::to_string)(input)
}

/// number = 1*DIGIT
fn number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(map_res(digit1, from_utf8), str::parse::<u32>)(input)
}

fn number64(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(map_res(digit1, from_utf8), str::parse::<u64>)(input)
}

/// quoted = DQUOTE *QUOTED-CHAR DQUOTE
fn quoted(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (mut rest, _) = tag(b"\"")(input)?;
    let mut out = Vec::new();
    loop {
        match rest.first().copied() {
            None | Some(b'\r') | Some(b'\n') => {
                return Err(nom::Err::Error(nom::error::make_error(
                    input,
                    nom::error::ErrorKind::Tag,
                )))
            }
            Some(b'"') => return Ok((&rest[1..], out)),
            Some(b'\\') if rest.len() >= 2 => {
                out.push(rest[1]);
                rest = &rest[2..];
            }
            Some(c) => {
                out.push(c);
                rest = &rest[1..];
            }
        }
    }
}

/// literal = "{" number ["+"] "}" CRLF *CHAR8
fn literal(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rest, (_, n, _, _, _)) =
        tuple((tag(b"{"), number, opt(tag(b"+")), tag(b"}"), crlf))(input)?;
    let (rest, bytes) = take(n as usize)(rest)?;
    Ok((rest, bytes.to_vec()))
}

/// string = quoted / literal
fn string_bytes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((quoted, literal))(input)
}

/// astring = 1*ASTRING-CHAR / string
fn astring(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((
        map(take_while1(is_astring_char), |b: &[u8]| b.to_vec()),
        string_bytes,
    ))(input)
}

fn astring_utf8(input: &[u8]) -> IResult<&[u8], String> {
    map(astring, |b| String::from_utf8_lossy(&b).into_owned())(input)
}

fn string_utf8(input: &[u8]) -> IResult<&[u8], String> {
    map(string_bytes, |b| String::from_utf8_lossy(&b).into_owned())(input)
}

fn nil(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag_no_case(b"NIL")(input)
}

fn mailbox(input: &[u8]) -> IResult<&[u8], MailboxName> {
    map(astring_utf8, |s| MailboxName::from_wire(&s))(input)
}

/// list-mailbox also allows the LIST wildcards `%` and `*`.
fn list_mailbox(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        map(
            take_while1(|b| is_astring_char(b) || b == b'%' || b == b'*'),
            |b: &[u8]| String::from_utf8_lossy(b).into_owned(),
        ),
        string_utf8,
    ))(input)
}

/// flag = "\" atom / atom
fn flag(input: &[u8]) -> IResult<&[u8], Flag> {
    map(
        pair(opt(tag(b"\\")), atom),
        |(backslash, name): (Option<&[u8]>, &str)| match backslash {
            Some(_) => Flag::from_wire(&format!("\\{}", name)),
            None => Flag::from_wire(name),
        },
    )(input)
}

fn flag_list(input: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    delimited(tag(b"("), separated_list0(sp, flag), tag(b")"))(input)
}

/// date-text = dd-MMM-yyyy
fn date_text(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_res(
        map_res(
            take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'-'),
            from_utf8,
        ),
        |s: &str| NaiveDate::parse_from_str(s, "%d-%b-%Y"),
    )(input)
}

/// date = date-text / DQUOTE date-text DQUOTE
fn date(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    alt((delimited(tag(b"\""), date_text, tag(b"\"")), date_text))(input)
}

/// date-time = DQUOTE dd-MMM-yyyy SP time SP zone DQUOTE
fn date_time(input: &[u8]) -> IResult<&[u8], DateTime<FixedOffset>> {
    map_res(
        delimited(
            tag(b"\""),
            map_res(take_while1(|b| b != b'"'), from_utf8),
            tag(b"\""),
        ),
        |s: &str| DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z"),
    )(input)
}

fn seq_set(input: &[u8]) -> IResult<&[u8], SequenceSet> {
    map_res(
        map_res(
            take_while1(|b: u8| b.is_ascii_digit() || matches!(b, b':' | b',' | b'*')),
            from_utf8,
        ),
        str::parse::<SequenceSet>,
    )(input)
}

// ----- search keys -----

fn search_key_noarg(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        value(SearchKey::All, tag_no_case("ALL")),
        value(SearchKey::Answered, tag_no_case("ANSWERED")),
        value(SearchKey::Deleted, tag_no_case("DELETED")),
        value(SearchKey::Draft, tag_no_case("DRAFT")),
        value(SearchKey::Flagged, tag_no_case("FLAGGED")),
        value(SearchKey::New, tag_no_case("NEW")),
        value(SearchKey::Old, tag_no_case("OLD")),
        value(SearchKey::Recent, tag_no_case("RECENT")),
        value(SearchKey::Seen, tag_no_case("SEEN")),
        value(SearchKey::Unanswered, tag_no_case("UNANSWERED")),
        value(SearchKey::Undeleted, tag_no_case("UNDELETED")),
        value(SearchKey::Undraft, tag_no_case("UNDRAFT")),
        value(SearchKey::Unflagged, tag_no_case("UNFLAGGED")),
        value(SearchKey::Unseen, tag_no_case("UNSEEN")),
    ))(input)
}

fn search_key_arg_a(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case("BCC "), astring_utf8), SearchKey::Bcc),
        map(preceded(tag_no_case("BEFORE "), date), SearchKey::Before),
        map(preceded(tag_no_case("BODY "), astring_utf8), SearchKey::Body),
        map(preceded(tag_no_case("CC "), astring_utf8), SearchKey::Cc),
        map(preceded(tag_no_case("FROM "), astring_utf8), SearchKey::From),
        map(
            tuple((tag_no_case("HEADER "), astring_utf8, sp, astring_utf8)),
            |(_, field, _, needle)| SearchKey::Header(field, needle),
        ),
        map(
            preceded(tag_no_case("KEYWORD "), atom_string),
            SearchKey::Keyword,
        ),
        map(preceded(tag_no_case("LARGER "), number), SearchKey::Larger),
        map(preceded(tag_no_case("MODSEQ "), number64), SearchKey::ModSeq),
        map(preceded(tag_no_case("NOT "), search_key), |key| {
            SearchKey::Not(Box::new(key))
        }),
        map(preceded(tag_no_case("ON "), date), SearchKey::On),
        map(
            tuple((tag_no_case("OR "), search_key, sp, search_key)),
            |(_, left, _, right)| SearchKey::Or(Box::new(left), Box::new(right)),
        ),
    ))(input)
}

fn search_key_arg_b(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(
            preceded(tag_no_case("SENTBEFORE "), date),
            SearchKey::SentBefore,
        ),
        map(preceded(tag_no_case("SENTON "), date), SearchKey::SentOn),
        map(
            preceded(tag_no_case("SENTSINCE "), date),
            SearchKey::SentSince,
        ),
        map(preceded(tag_no_case("SINCE "), date), SearchKey::Since),
        map(preceded(tag_no_case("SMALLER "), number), SearchKey::Smaller),
        map(
            preceded(tag_no_case("SUBJECT "), astring_utf8),
            SearchKey::Subject,
        ),
        map(preceded(tag_no_case("TEXT "), astring_utf8), SearchKey::Text),
        map(preceded(tag_no_case("TO "), astring_utf8), SearchKey::To),
        map(preceded(tag_no_case("UID "), seq_set), SearchKey::Uid),
        map(
            preceded(tag_no_case("UNKEYWORD "), atom_string),
            SearchKey::Unkeyword,
        ),
    ))(input)
}

/// search-key, including the parenthesized AND group and the bare
/// sequence-set form. The sequence-set branch must stay last.
fn search_key(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        search_key_noarg,
        search_key_arg_a,
        search_key_arg_b,
        map(
            delimited(tag(b"("), separated_list1(sp, search_key), tag(b")")),
            SearchKey::and,
        ),
        map(seq_set, SearchKey::SequenceSet),
    ))(input)
}

// ----- fetch attributes -----

fn header_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(tag(b"("), separated_list1(sp, astring_utf8), tag(b")"))(input)
}

fn section(input: &[u8]) -> IResult<&[u8], Section> {
    delimited(
        tag(b"["),
        map(
            opt(alt((
                map(
                    preceded(tag_no_case("HEADER.FIELDS.NOT "), header_list),
                    Section::HeaderFieldsNot,
                ),
                map(
                    preceded(tag_no_case("HEADER.FIELDS "), header_list),
                    Section::HeaderFields,
                ),
                value(Section::Header, tag_no_case("HEADER")),
                value(Section::Text, tag_no_case("TEXT")),
            ))),
            |section| section.unwrap_or(Section::Full),
        ),
        tag(b"]"),
    )(input)
}

fn partial(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    delimited(
        tag(b"<"),
        map(tuple((number, tag(b"."), number)), |(a, _, b)| (a, b)),
        tag(b">"),
    )(input)
}

fn fetch_item(input: &[u8]) -> IResult<&[u8], FetchItem> {
    alt((
        value(FetchItem::Flags, tag_no_case("FLAGS")),
        value(FetchItem::InternalDate, tag_no_case("INTERNALDATE")),
        value(FetchItem::Rfc822Size, tag_no_case("RFC822.SIZE")),
        value(FetchItem::Rfc822Header, tag_no_case("RFC822.HEADER")),
        value(FetchItem::Rfc822Text, tag_no_case("RFC822.TEXT")),
        value(FetchItem::Rfc822, tag_no_case("RFC822")),
        value(FetchItem::Envelope, tag_no_case("ENVELOPE")),
        value(FetchItem::BodyStructure, tag_no_case("BODYSTRUCTURE")),
        value(FetchItem::ModSeq, tag_no_case("MODSEQ")),
        value(FetchItem::Uid, tag_no_case("UID")),
        map(
            tuple((tag_no_case("BODY.PEEK"), section, opt(partial))),
            |(_, section, partial)| FetchItem::Body {
                section,
                partial,
                peek: true,
            },
        ),
        map(
            tuple((tag_no_case("BODY"), section, opt(partial))),
            |(_, section, partial)| FetchItem::Body {
                section,
                partial,
                peek: false,
            },
        ),
        // bare BODY is the structure without extension data
        value(FetchItem::BodyStructure, tag_no_case("BODY")),
    ))(input)
}

fn fetch_items(input: &[u8]) -> IResult<&[u8], FetchItems> {
    alt((
        value(FetchItems::All, tag_no_case("ALL")),
        value(FetchItems::Full, tag_no_case("FULL")),
        value(FetchItems::Fast, tag_no_case("FAST")),
        map(
            delimited(tag(b"("), separated_list1(sp, fetch_item), tag(b")")),
            FetchItems::Items,
        ),
        map(fetch_item, |item| FetchItems::Items(vec![item])),
    ))(input)
}

fn status_item(input: &[u8]) -> IResult<&[u8], StatusItem> {
    alt((
        value(StatusItem::Messages, tag_no_case("MESSAGES")),
        value(StatusItem::Recent, tag_no_case("RECENT")),
        value(StatusItem::UidNext, tag_no_case("UIDNEXT")),
        value(StatusItem::UidValidity, tag_no_case("UIDVALIDITY")),
        value(StatusItem::Unseen, tag_no_case("UNSEEN")),
        value(StatusItem::HighestModSeq, tag_no_case("HIGHESTMODSEQ")),
    ))(input)
}

// ----- command bodies -----

fn body_any_state(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Capability, tag_no_case("CAPABILITY")),
        value(CommandBody::Noop, tag_no_case("NOOP")),
        value(CommandBody::Logout, tag_no_case("LOGOUT")),
        map(
            preceded(
                tag_no_case("ID "),
                alt((
                    map(nil, |_| None),
                    map(
                        delimited(
                            tag(b"("),
                            separated_list0(
                                sp,
                                pair(
                                    string_utf8,
                                    preceded(
                                        sp,
                                        alt((map(nil, |_| None), map(string_utf8, Some))),
                                    ),
                                ),
                            ),
                            tag(b")"),
                        ),
                        Some,
                    ),
                )),
            ),
            |parameters| CommandBody::Id { parameters },
        ),
    ))(input)
}

fn is_base64_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')
}

fn body_not_authenticated(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::StartTls, tag_no_case("STARTTLS")),
        map(
            tuple((
                tag_no_case("AUTHENTICATE "),
                atom_string,
                opt(preceded(sp, take_while1(is_base64_char))),
            )),
            |(_, mechanism, initial)| CommandBody::Authenticate {
                mechanism,
                initial_response: initial.map(|b: &[u8]| b.to_vec()),
            },
        ),
        map(
            tuple((tag_no_case("LOGIN "), astring_utf8, sp, astring_utf8)),
            |(_, username, _, password)| CommandBody::Login { username, password },
        ),
    ))(input)
}

fn condstore_param(input: &[u8]) -> IResult<&[u8], bool> {
    map(
        opt(preceded(sp, tag_no_case("(CONDSTORE)"))),
        |c: Option<&[u8]>| c.is_some(),
    )(input)
}

fn body_authenticated(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        map(
            tuple((tag_no_case("SELECT "), mailbox, condstore_param)),
            |(_, mailbox, condstore)| CommandBody::Select { mailbox, condstore },
        ),
        map(
            tuple((tag_no_case("EXAMINE "), mailbox, condstore_param)),
            |(_, mailbox, condstore)| CommandBody::Examine { mailbox, condstore },
        ),
        map(preceded(tag_no_case("CREATE "), mailbox), |mailbox| {
            CommandBody::Create { mailbox }
        }),
        map(preceded(tag_no_case("DELETE "), mailbox), |mailbox| {
            CommandBody::Delete { mailbox }
        }),
        map(
            tuple((tag_no_case("RENAME "), mailbox, sp, mailbox)),
            |(_, from, _, to)| CommandBody::Rename { from, to },
        ),
        map(preceded(tag_no_case("SUBSCRIBE "), mailbox), |mailbox| {
            CommandBody::Subscribe { mailbox }
        }),
        map(preceded(tag_no_case("UNSUBSCRIBE "), mailbox), |mailbox| {
            CommandBody::Unsubscribe { mailbox }
        }),
        map(
            tuple((tag_no_case("LIST "), astring_utf8, sp, list_mailbox)),
            |(_, reference, _, pattern)| CommandBody::List { reference, pattern },
        ),
        map(
            tuple((tag_no_case("LSUB "), astring_utf8, sp, list_mailbox)),
            |(_, reference, _, pattern)| CommandBody::Lsub { reference, pattern },
        ),
        map(
            tuple((
                tag_no_case("STATUS "),
                mailbox,
                sp,
                delimited(tag(b"("), separated_list1(sp, status_item), tag(b")")),
            )),
            |(_, mailbox, _, items)| CommandBody::Status { mailbox, items },
        ),
        map(
            tuple((
                tag_no_case("APPEND "),
                mailbox,
                opt(preceded(sp, flag_list)),
                opt(preceded(sp, date_time)),
                preceded(sp, literal),
            )),
            |(_, mailbox, flags, date, message)| CommandBody::Append {
                mailbox,
                flags: flags.unwrap_or_default(),
                date,
                message,
            },
        ),
        map(
            preceded(tag_no_case("ENABLE"), many1(preceded(sp, atom_string))),
            |capabilities| CommandBody::Enable { capabilities },
        ),
        map(
            preceded(tag_no_case("COMPRESS "), atom_string),
            |algorithm| CommandBody::Compress { algorithm },
        ),
        value(CommandBody::Namespace, tag_no_case("NAMESPACE")),
        value(CommandBody::Idle, tag_no_case("IDLE")),
    ))(input)
}

fn body_selected(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Check, tag_no_case("CHECK")),
        value(CommandBody::Close, tag_no_case("CLOSE")),
        value(CommandBody::Unselect, tag_no_case("UNSELECT")),
        map(
            preceded(tag_no_case("EXPUNGE"), opt(preceded(sp, seq_set))),
            |uid_sequence_set| CommandBody::Expunge { uid_sequence_set },
        ),
        search_body,
        fetch_body,
        store_body,
        map(
            tuple((tag_no_case("COPY "), seq_set, sp, mailbox)),
            |(_, sequence_set, _, mailbox)| CommandBody::Copy {
                sequence_set,
                mailbox,
                uid: false,
            },
        ),
        map(
            tuple((tag_no_case("MOVE "), seq_set, sp, mailbox)),
            |(_, sequence_set, _, mailbox)| CommandBody::Move {
                sequence_set,
                mailbox,
                uid: false,
            },
        ),
        map(preceded(tag_no_case("UID "), body_selected), set_uid),
    ))(input)
}

fn search_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case("SEARCH"),
            preceded(
                opt(tuple((sp, tag_no_case("CHARSET"), sp, astring_utf8))),
                many1(preceded(sp, search_key)),
            ),
        ),
        |criteria| CommandBody::Search {
            criteria,
            uid: false,
        },
    )(input)
}

fn fetch_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case("FETCH "),
            seq_set,
            sp,
            fetch_items,
            opt(delimited(
                tag_no_case(" (CHANGEDSINCE "),
                number64,
                tag(b")"),
            )),
        )),
        |(_, sequence_set, _, items, changed_since)| CommandBody::Fetch {
            sequence_set,
            items,
            changed_since,
            uid: false,
        },
    )(input)
}

fn store_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case("STORE "),
            seq_set,
            opt(delimited(
                tag_no_case(" (UNCHANGEDSINCE "),
                number64,
                tag(b")"),
            )),
            sp,
            opt(alt((value('+', tag(b"+")), value('-', tag(b"-"))))),
            tag_no_case("FLAGS"),
            opt(tag_no_case(".SILENT")),
            sp,
            alt((flag_list, separated_list1(sp, flag))),
        )),
        |(_, sequence_set, unchanged_since, _, sign, _, silent, _, flags)| CommandBody::Store {
            sequence_set,
            action: match sign {
                Some('+') => StoreAction::Add,
                Some('-') => StoreAction::Remove,
                _ => StoreAction::Replace,
            },
            response: match silent {
                Some(_) => StoreResponse::Silent,
                None => StoreResponse::Answer,
            },
            flags,
            unchanged_since,
            uid: false,
        },
    )(input)
}

fn set_uid(body: CommandBody) -> CommandBody {
    match body {
        CommandBody::Fetch {
            sequence_set,
            items,
            changed_since,
            ..
        } => CommandBody::Fetch {
            sequence_set,
            items,
            changed_since,
            uid: true,
        },
        CommandBody::Store {
            sequence_set,
            action,
            response,
            flags,
            unchanged_since,
            ..
        } => CommandBody::Store {
            sequence_set,
            action,
            response,
            flags,
            unchanged_since,
            uid: true,
        },
        CommandBody::Search { criteria, .. } => CommandBody::Search {
            criteria,
            uid: true,
        },
        CommandBody::Copy {
            sequence_set,
            mailbox,
            ..
        } => CommandBody::Copy {
            sequence_set,
            mailbox,
            uid: true,
        },
        CommandBody::Move {
            sequence_set,
            mailbox,
            ..
        } => CommandBody::Move {
            sequence_set,
            mailbox,
            uid: true,
        },
        other => other,
    }
}

fn command_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        body_any_state,
        body_not_authenticated,
        body_selected,
        body_authenticated,
    ))(input)
}

fn command(input: &[u8]) -> IResult<&[u8], Command> {
    map(
        tuple((
            map_res(take_while1(is_tag_char), from_utf8),
            sp,
            command_body,
            crlf,
        )),
        |(tag, _, body, _)| Command {
            tag: Tag(tag.to_string()),
            body,
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_command(line.as_bytes()).unwrap()
    }

    #[test]
    fn parses_login_with_quoted_password() {
        let cmd = parse("a001 LOGIN alice \"hun \\\"ter\\\" 2\"\r\n");
        assert_eq!(cmd.tag.0, "a001");
        assert_eq!(cmd.body, CommandBody::Login {
            username: "alice".to_string(),
            password: "hun \"ter\" 2".to_string(),
        });
    }

    #[test]
    fn parses_login_with_literal_password() {
        let cmd = parse_command(b"a001 LOGIN alice {7}\r\nhunter2\r\n").unwrap();
        assert_eq!(cmd.body, CommandBody::Login {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        });
    }

    #[test]
    fn parses_select_with_condstore() {
        let cmd = parse("a SELECT inbox (CONDSTORE)\r\n");
        match cmd.body {
            CommandBody::Select { mailbox, condstore } => {
                assert_eq!(mailbox.as_str(), "INBOX");
                assert!(condstore);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_uid_fetch_with_changedsince() {
        let cmd = parse("a UID FETCH 1:* (FLAGS UID) (CHANGEDSINCE 42)\r\n");
        match cmd.body {
            CommandBody::Fetch {
                items,
                changed_since,
                uid,
                ..
            } => {
                assert!(uid);
                assert_eq!(changed_since, Some(42));
                assert_eq!(
                    items.expand(),
                    vec![FetchItem::Flags, FetchItem::Uid]
                );
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_store_with_unchangedsince() {
        let cmd = parse("a STORE 1:3 (UNCHANGEDSINCE 70) +FLAGS (\\Seen)\r\n");
        match cmd.body {
            CommandBody::Store {
                action,
                response,
                flags,
                unchanged_since,
                uid,
                ..
            } => {
                assert_eq!(action, StoreAction::Add);
                assert_eq!(response, StoreResponse::Answer);
                assert_eq!(flags, vec![Flag::Seen]);
                assert_eq!(unchanged_since, Some(70));
                assert!(!uid);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_search_program() {
        let cmd = parse("a UID SEARCH OR FROM alice NOT SEEN UID 44,54:* LARGER 1024\r\n");
        match cmd.body {
            CommandBody::Search { criteria, uid } => {
                assert!(uid);
                assert_eq!(criteria.len(), 3);
                assert_eq!(
                    criteria[0],
                    SearchKey::Or(
                        Box::new(SearchKey::From("alice".to_string())),
                        Box::new(SearchKey::Not(Box::new(SearchKey::Seen))),
                    )
                );
                assert_eq!(
                    criteria[1],
                    SearchKey::Uid("44,54:*".parse().unwrap())
                );
                assert_eq!(criteria[2], SearchKey::Larger(1024));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_bare_sequence_set_search() {
        let cmd = parse("a SEARCH 1,2,4:6 UNDELETED\r\n");
        match cmd.body {
            CommandBody::Search { criteria, .. } => {
                assert_eq!(
                    criteria[0],
                    SearchKey::SequenceSet("1,2,4:6".parse().unwrap())
                );
                assert_eq!(criteria[1], SearchKey::Undeleted);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_search_dates_and_modseq() {
        let cmd = parse("a SEARCH SENTBEFORE 1-Feb-1994 MODSEQ 620162338\r\n");
        match cmd.body {
            CommandBody::Search { criteria, .. } => {
                assert_eq!(
                    criteria[0],
                    SearchKey::SentBefore(NaiveDate::from_ymd_opt(1994, 2, 1).unwrap())
                );
                assert_eq!(criteria[1], SearchKey::ModSeq(620162338));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_append_with_flags_date_and_literal() {
        let cmd = parse_command(
            b"a APPEND Drafts (\\Draft) \"01-Jan-2020 10:00:00 +0000\" {12}\r\nhello world!\r\n",
        )
        .unwrap();
        match cmd.body {
            CommandBody::Append {
                mailbox,
                flags,
                date,
                message,
            } => {
                assert_eq!(mailbox.as_str(), "Drafts");
                assert_eq!(flags, vec![Flag::Draft]);
                assert!(date.is_some());
                assert_eq!(message, b"hello world!");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_body_peek_section() {
        let cmd = parse("a FETCH 1 BODY.PEEK[HEADER.FIELDS (From Subject)]<0.512>\r\n");
        match cmd.body {
            CommandBody::Fetch { items, .. } => {
                assert_eq!(items.expand(), vec![FetchItem::Body {
                    section: Section::HeaderFields(vec![
                        "From".to_string(),
                        "Subject".to_string()
                    ]),
                    partial: Some((0, 512)),
                    peek: true,
                }]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_authenticate_with_initial_response() {
        let cmd = parse("a AUTHENTICATE PLAIN AGFsaWNlAGh1bnRlcjI=\r\n");
        match cmd.body {
            CommandBody::Authenticate {
                mechanism,
                initial_response,
            } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(initial_response.unwrap(), b"AGFsaWNlAGh1bnRlcjI=");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn rejects_trailing_garbage_and_missing_crlf() {
        assert!(parse_command(b"a NOOP").is_err());
        assert!(parse_command(b"a NOOP\r\nx").is_err());
        assert!(parse_command(b"a FETCH 0 FLAGS\r\n").is_err());
    }
}
