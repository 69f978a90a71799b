//! Streaming reply parser.
//!
//! Pull-based: callers hand in whatever bytes they have buffered and get
//! back `Ok(None)` ("need more data"), `Ok(Some((consumed, reply)))`, or
//! `Err(reason)` for input that can never become a valid reply —
//! including `ERROR`/`CLIENT_ERROR` lines, which are fatal to the
//! connection. Unknown reply flags are skipped without losing position.

use btoi::{btoi, btou};
use nom::{
    branch::alt,
    bytes::streaming::{tag, take, take_while, take_while_m_n},
    character::{is_digit, streaming::crlf},
    combinator::{map, map_res, value},
    multi::many0,
    sequence::tuple,
    IResult, Needed,
};

use super::{MetaReply, ResponseFlags};

/// Reply-line status codes with a shared `<code> <flags>\r\n` shape.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Code {
    Success,
    Miss,
    NotStored,
    Conflict,
}

enum RawLine<'a> {
    Status(Code, Vec<(u8, &'a [u8])>),
    Value(Vec<(u8, &'a [u8])>, &'a [u8]),
    ServerError(&'a [u8]),
    Fatal(&'a [u8]),
}

/// Parses one reply off the front of `buf`.
pub(crate) fn parse_meta_reply(buf: &[u8]) -> Result<Option<(usize, MetaReply)>, String> {
    match raw_line(buf) {
        Ok((remaining, raw)) => {
            let consumed = buf.len() - remaining.len();
            let reply = match raw {
                RawLine::Status(code, tokens) => {
                    let flags = build_flags(tokens)?;
                    match code {
                        Code::Success => MetaReply::Success(flags),
                        Code::Miss => MetaReply::Miss(flags),
                        Code::NotStored => MetaReply::NotStored(flags),
                        Code::Conflict => MetaReply::Conflict(flags),
                    }
                }
                RawLine::Value(tokens, data) => MetaReply::Value {
                    flags: build_flags(tokens)?,
                    data: data.to_vec(),
                },
                RawLine::ServerError(msg) => {
                    MetaReply::ServerError(String::from_utf8_lossy(msg).into_owned())
                }
                RawLine::Fatal(msg) => return Err(String::from_utf8_lossy(msg).into_owned()),
            };
            Ok(Some((consumed, reply)))
        }
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(e.code.description().to_string())
        }
    }
}

fn raw_line(buf: &[u8]) -> IResult<&[u8], RawLine<'_>> {
    alt((value_line, status_line, error_line))(buf)
}

fn status_line(buf: &[u8]) -> IResult<&[u8], RawLine<'_>> {
    let (input, code) = alt((
        value(Code::Success, tag(b"HD")),
        value(Code::Miss, tag(b"EN")),
        value(Code::Miss, tag(b"NF")),
        value(Code::NotStored, tag(b"NS")),
        value(Code::Conflict, tag(b"EX")),
    ))(buf)?;
    let (input, tokens) = flag_tokens(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, RawLine::Status(code, tokens)))
}

fn value_line(buf: &[u8]) -> IResult<&[u8], RawLine<'_>> {
    let (input, _) = tag(b"VA ")(buf)?;
    let (input, size) = parse_u64(input)?;
    let (input, tokens) = flag_tokens(input)?;
    let (input, _) = crlf(input)?;
    let (input, data) = take_until_size(input, size as usize)?;
    Ok((input, RawLine::Value(tokens, data)))
}

fn error_line(buf: &[u8]) -> IResult<&[u8], RawLine<'_>> {
    alt((
        map(
            tuple((tag(b"SERVER_ERROR "), line_remainder, crlf)),
            |(_, msg, _)| RawLine::ServerError(msg),
        ),
        map(
            tuple((tag(b"CLIENT_ERROR "), line_remainder, crlf)),
            |(_, msg, _)| RawLine::Fatal(msg),
        ),
        map(tuple((tag(b"ERROR"), line_remainder, crlf)), |(_, _, _)| {
            RawLine::Fatal(b"ERROR")
        }),
    ))(buf)
}

fn line_remainder(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while(|c| c != b'\r')(input)
}

/// ` <letter><token>` pairs up to the CRLF. A flag may have an empty
/// token (`W`, `Z`, `X`).
fn flag_tokens(input: &[u8]) -> IResult<&[u8], Vec<(u8, &[u8])>> {
    many0(map(
        tuple((
            tag(b" "),
            map(take(1usize), |s: &[u8]| s[0]),
            take_while(|c: u8| c != b'\r' && c != b' '),
        )),
        |(_, flag, token)| (flag, token),
    ))(input)
}

/// The payload is length-delimited; CRLF bytes inside it are data, so
/// only the declared size decides where it ends.
fn take_until_size(buf: &[u8], size: usize) -> IResult<&[u8], &[u8]> {
    if buf.len() < size {
        return Err(nom::Err::Incomplete(Needed::new(size - buf.len() + 2)));
    }
    let (data, remaining) = buf.split_at(size);
    let (remaining, _) = tag(b"\r\n")(remaining)?;
    Ok((remaining, data))
}

fn build_flags(tokens: Vec<(u8, &[u8])>) -> Result<ResponseFlags, String> {
    let mut flags = ResponseFlags::default();
    for (letter, token) in tokens {
        match letter {
            b'c' => flags.cas_token = Some(unsigned(letter, token)?),
            b'h' => flags.fetched = Some(token != b"0"),
            b'l' => flags.last_access = Some(unsigned(letter, token)?),
            b't' => flags.ttl = Some(signed(letter, token)?),
            b'f' => {
                flags.client_flag =
                    Some(btou::<u32>(token).map_err(|_| bad_token(letter, token))?)
            }
            b'W' => flags.win = Some(true),
            b'Z' => flags.win = Some(false),
            b'X' => flags.stale = true,
            b's' => flags.real_size = Some(unsigned(letter, token)?),
            b'O' => flags.opaque = Some(token.to_vec()),
            b'k' => flags.key = Some(token.to_vec()),
            _ => {}
        }
    }
    Ok(flags)
}

fn unsigned(letter: u8, token: &[u8]) -> Result<u64, String> {
    btou(token).map_err(|_| bad_token(letter, token))
}

fn signed(letter: u8, token: &[u8]) -> Result<i64, String> {
    btoi(token).map_err(|_| bad_token(letter, token))
}

fn bad_token(letter: u8, token: &[u8]) -> String {
    format!(
        "bad {} flag token: {}",
        letter as char,
        String::from_utf8_lossy(token)
    )
}

pub(crate) fn parse_u64(buf: &[u8]) -> IResult<&[u8], u64> {
    map_res(take_while_m_n(1, 20, is_digit), btou)(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(buf: &[u8]) -> (usize, MetaReply) {
        parse_meta_reply(buf)
            .expect("parse failed")
            .expect("needed more data")
    }

    #[test]
    fn test_success_with_no_flags() {
        let (n, reply) = one(b"HD\r\n");
        assert_eq!(n, 4);
        assert_eq!(reply, MetaReply::Success(ResponseFlags::default()));
    }

    #[test]
    fn test_success_with_cas_flag() {
        let (_, reply) = one(b"HD c31\r\n");
        let expected = ResponseFlags {
            cas_token: Some(31),
            ..ResponseFlags::default()
        };
        assert_eq!(reply, MetaReply::Success(expected));
    }

    #[test]
    fn test_value_with_flags_and_data() {
        let (n, reply) = one(b"VA 10 h1 l56 t2179 f9001\r\ntest-value\r\n");
        assert_eq!(n, 38);
        match reply {
            MetaReply::Value { flags, data } => {
                assert_eq!(data, b"test-value");
                assert_eq!(flags.fetched, Some(true));
                assert_eq!(flags.last_access, Some(56));
                assert_eq!(flags.ttl, Some(2179));
                assert_eq!(flags.client_flag, Some(9001));
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_value_with_embedded_crlf_in_data() {
        let (_, reply) = one(b"VA 12\r\ntest-\r\nvalue\r\n");
        match reply {
            MetaReply::Value { data, .. } => assert_eq!(data, b"test-\r\nvalue"),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_value_with_win_flag() {
        let (_, reply) = one(b"VA 0 W c1\r\n\r\n");
        match reply {
            MetaReply::Value { flags, data } => {
                assert!(data.is_empty());
                assert_eq!(flags.win, Some(true));
                assert_eq!(flags.cas_token, Some(1));
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_lose_flag_maps_to_win_false() {
        let (_, reply) = one(b"VA 0 Z c1\r\n\r\n");
        match reply {
            MetaReply::Value { flags, .. } => assert_eq!(flags.win, Some(false)),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_flag() {
        let (_, reply) = one(b"VA 3 X t4\r\nold\r\n");
        match reply {
            MetaReply::Value { flags, data } => {
                assert!(flags.stale);
                assert_eq!(flags.ttl, Some(4));
                assert_eq!(data, b"old");
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_immortal_ttl_is_negative_one() {
        let (_, reply) = one(b"HD t-1\r\n");
        match reply {
            MetaReply::Success(flags) => assert_eq!(flags.ttl, Some(-1)),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_miss_variants() {
        assert!(matches!(one(b"EN\r\n").1, MetaReply::Miss(_)));
        assert!(matches!(one(b"NF\r\n").1, MetaReply::Miss(_)));
    }

    #[test]
    fn test_not_stored_and_conflict() {
        assert!(matches!(one(b"NS\r\n").1, MetaReply::NotStored(_)));
        assert!(matches!(one(b"EX\r\n").1, MetaReply::Conflict(_)));
    }

    #[test]
    fn test_opaque_and_key_echo() {
        let (_, reply) = one(b"EN Oreq-7 kmissing-key\r\n");
        match reply {
            MetaReply::Miss(flags) => {
                assert_eq!(flags.opaque, Some(b"req-7".to_vec()));
                assert_eq!(flags.key, Some(b"missing-key".to_vec()));
            }
            other => panic!("expected miss, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_flags_are_skipped() {
        let (_, reply) = one(b"HD c5 y9 t60\r\n");
        match reply {
            MetaReply::Success(flags) => {
                assert_eq!(flags.cas_token, Some(5));
                assert_eq!(flags.ttl, Some(60));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_server_error_is_a_reply_not_a_parse_failure() {
        let (n, reply) = one(b"SERVER_ERROR out of memory\r\n");
        assert_eq!(n, 28);
        assert_eq!(reply, MetaReply::ServerError("out of memory".to_string()));
    }

    #[test]
    fn test_client_error_is_fatal() {
        assert!(parse_meta_reply(b"CLIENT_ERROR bad data chunk\r\n").is_err());
    }

    #[test]
    fn test_error_line_is_fatal() {
        assert!(parse_meta_reply(b"ERROR\r\n").is_err());
    }

    #[test]
    fn test_incomplete_status_line_needs_more_data() {
        assert_eq!(parse_meta_reply(b"H").unwrap(), None);
        assert_eq!(parse_meta_reply(b"HD c31").unwrap(), None);
    }

    #[test]
    fn test_incomplete_payload_needs_more_data() {
        assert_eq!(parse_meta_reply(b"VA 10\r\ntest-").unwrap(), None);
        assert_eq!(parse_meta_reply(b"VA 10\r\ntest-value").unwrap(), None);
    }

    #[test]
    fn test_garbage_is_a_parse_failure() {
        assert!(parse_meta_reply(b"WAT 3\r\n").is_err());
    }

    #[test]
    fn test_bad_flag_token_is_a_parse_failure() {
        assert!(parse_meta_reply(b"HD cnope\r\n").is_err());
    }

    #[test]
    fn test_consumed_length_leaves_next_reply_in_place() {
        let buf = b"HD\r\nVA 1 f0\r\nx\r\n";
        let (n, first) = one(buf);
        assert!(matches!(first, MetaReply::Success(_)));
        let (m, second) = one(&buf[n..]);
        assert_eq!(n + m, buf.len());
        match second {
            MetaReply::Value { data, .. } => assert_eq!(data, b"x"),
            other => panic!("expected value, got {:?}", other),
        }
    }
}
