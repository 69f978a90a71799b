//! Request encoding: one meta command per line, assembled into a single
//! buffer so a logical request goes out in one write.

use bytes::{BufMut, BytesMut};

use super::{ArithMode, RequestFlags};
use crate::key::Key;

fn put_key(buf: &mut BytesMut, key: &Key) -> bool {
    let (token, binary) = key.wire_token();
    buf.put_slice(&token);
    binary
}

fn put_flag(buf: &mut BytesMut, letter: u8) {
    buf.put_u8(b' ');
    buf.put_u8(letter);
}

fn put_flag_u64(buf: &mut BytesMut, letter: u8, token: u64) {
    put_flag(buf, letter);
    buf.put_slice(token.to_string().as_bytes());
}

fn put_flag_u32(buf: &mut BytesMut, letter: u8, token: u32) {
    put_flag_u64(buf, letter, u64::from(token));
}

fn put_flag_bytes(buf: &mut BytesMut, letter: u8, token: &[u8]) {
    put_flag(buf, letter);
    buf.put_slice(token);
}

/// `mg <key> <flags>\r\n`
pub(crate) fn meta_get(key: &Key, flags: &RequestFlags) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(b"mg ");
    let binary = put_key(&mut buf, key);
    put_get_flags(&mut buf, flags, binary);
    buf.put_slice(b"\r\n");
    buf
}

/// One `mg` line per key, pipelined into a single buffer. Replies come
/// back in request order.
pub(crate) fn meta_multiget<'a>(
    keys: impl IntoIterator<Item = &'a Key>,
    flags: &RequestFlags,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    for key in keys {
        buf.put_slice(b"mg ");
        let binary = put_key(&mut buf, key);
        put_get_flags(&mut buf, flags, binary);
        buf.put_slice(b"\r\n");
    }
    buf
}

fn put_get_flags(buf: &mut BytesMut, flags: &RequestFlags, binary: bool) {
    if flags.return_value {
        put_flag(buf, b'v');
    }
    if flags.return_cas_token {
        put_flag(buf, b'c');
    }
    if flags.return_client_flag {
        put_flag(buf, b'f');
    }
    if flags.return_fetched {
        put_flag(buf, b'h');
    }
    if flags.return_last_access {
        put_flag(buf, b'l');
    }
    if flags.return_ttl {
        put_flag(buf, b't');
    }
    if flags.return_key {
        put_flag(buf, b'k');
    }
    if flags.return_size {
        put_flag(buf, b's');
    }
    if flags.no_update_lru {
        put_flag(buf, b'u');
    }
    if let Some(ttl) = flags.cache_ttl {
        put_flag_u32(buf, b'T', ttl);
    }
    if let Some(ttl) = flags.vivify_on_miss_ttl {
        put_flag_u32(buf, b'N', ttl);
    }
    if let Some(ttl) = flags.recache_ttl {
        put_flag_u32(buf, b'R', ttl);
    }
    if let Some(opaque) = &flags.opaque {
        put_flag_bytes(buf, b'O', opaque);
    }
    if flags.no_reply {
        put_flag(buf, b'q');
    }
    if binary {
        put_flag(buf, b'b');
    }
}

/// `ms <key> S<size> <flags>\r\n<payload>\r\n`
pub(crate) fn meta_set(key: &Key, flags: &RequestFlags, value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64 + value.len());
    buf.put_slice(b"ms ");
    let binary = put_key(&mut buf, key);
    put_flag_u64(&mut buf, b'S', value.len() as u64);
    if let Some(ttl) = flags.cache_ttl {
        put_flag_u32(&mut buf, b'T', ttl);
    }
    if let Some(client_flag) = flags.client_flag {
        put_flag_u32(&mut buf, b'F', client_flag);
    }
    if let Some(cas) = flags.cas_token {
        put_flag_u64(&mut buf, b'C', cas);
    }
    put_flag(&mut buf, b'M');
    buf.put_u8(flags.set_mode.token());
    if flags.mark_stale {
        put_flag(&mut buf, b'I');
    }
    if flags.return_cas_token {
        put_flag(&mut buf, b'c');
    }
    if let Some(opaque) = &flags.opaque {
        put_flag_bytes(&mut buf, b'O', opaque);
    }
    if flags.no_reply {
        put_flag(&mut buf, b'q');
    }
    if binary {
        put_flag(&mut buf, b'b');
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
    buf
}

/// `md <key> <flags>\r\n`
///
/// With `mark_stale`, the TTL travels on the `I` token and the item is
/// left in place, stale, with a bumped CAS.
pub(crate) fn meta_delete(key: &Key, flags: &RequestFlags) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(b"md ");
    let binary = put_key(&mut buf, key);
    if let Some(cas) = flags.cas_token {
        put_flag_u64(&mut buf, b'C', cas);
    }
    if flags.mark_stale {
        match flags.cache_ttl {
            Some(ttl) => put_flag_u32(&mut buf, b'I', ttl),
            None => put_flag(&mut buf, b'I'),
        }
    } else if let Some(ttl) = flags.cache_ttl {
        put_flag_u32(&mut buf, b'T', ttl);
    }
    if let Some(opaque) = &flags.opaque {
        put_flag_bytes(&mut buf, b'O', opaque);
    }
    if flags.no_reply {
        put_flag(&mut buf, b'q');
    }
    if binary {
        put_flag(&mut buf, b'b');
    }
    buf.put_slice(b"\r\n");
    buf
}

/// `ma <key> <flags>\r\n`
pub(crate) fn meta_arithmetic(key: &Key, flags: &RequestFlags) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(b"ma ");
    let binary = put_key(&mut buf, key);
    if flags.arith_mode == ArithMode::Decr {
        put_flag_bytes(&mut buf, b'M', b"D");
    }
    if let Some(delta) = flags.ma_delta_value {
        put_flag_u64(&mut buf, b'D', delta);
    }
    if let Some(initial) = flags.ma_initial_value {
        put_flag_u64(&mut buf, b'J', initial);
    }
    if let Some(ttl) = flags.vivify_on_miss_ttl {
        put_flag_u32(&mut buf, b'N', ttl);
    }
    if let Some(ttl) = flags.cache_ttl {
        put_flag_u32(&mut buf, b'T', ttl);
    }
    if let Some(cas) = flags.cas_token {
        put_flag_u64(&mut buf, b'C', cas);
    }
    if flags.return_value {
        put_flag(&mut buf, b'v');
    }
    if let Some(opaque) = &flags.opaque {
        put_flag_bytes(&mut buf, b'O', opaque);
    }
    if flags.no_reply {
        put_flag(&mut buf, b'q');
    }
    if binary {
        put_flag(&mut buf, b'b');
    }
    buf.put_slice(b"\r\n");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SetMode;

    fn get_flags() -> RequestFlags {
        RequestFlags {
            return_value: true,
            ..RequestFlags::default()
        }
    }

    #[test]
    fn test_simple_get() {
        let buf = meta_get(&Key::from("foo"), &get_flags());
        assert_eq!(&buf[..], b"mg foo v\r\n");
    }

    #[test]
    fn test_get_with_touch_and_recache() {
        let flags = RequestFlags {
            return_cas_token: true,
            cache_ttl: Some(300),
            recache_ttl: Some(30),
            ..get_flags()
        };
        let buf = meta_get(&Key::from("foo"), &flags);
        assert_eq!(&buf[..], b"mg foo v c T300 R30\r\n");
    }

    #[test]
    fn test_simple_set() {
        let flags = RequestFlags {
            cache_ttl: Some(60),
            ..RequestFlags::default()
        };
        let buf = meta_set(&Key::from("foo"), &flags, b"bar");
        assert_eq!(&buf[..], b"ms foo S3 T60 MS\r\nbar\r\n");
    }

    #[test]
    fn test_set_with_cas() {
        let flags = RequestFlags {
            cache_ttl: Some(60),
            cas_token: Some(42),
            ..RequestFlags::default()
        };
        let buf = meta_set(&Key::from("k"), &flags, b"v");
        assert_eq!(&buf[..], b"ms k S1 T60 C42 MS\r\nv\r\n");
    }

    #[test]
    fn test_set_with_cas_and_mark_stale() {
        let flags = RequestFlags {
            cache_ttl: Some(60),
            cas_token: Some(42),
            mark_stale: true,
            ..RequestFlags::default()
        };
        let buf = meta_set(&Key::from("k"), &flags, b"v");
        assert_eq!(&buf[..], b"ms k S1 T60 C42 MS I\r\nv\r\n");
    }

    #[test]
    fn test_set_binary_key() {
        let flags = RequestFlags {
            cache_ttl: Some(60),
            ..RequestFlags::default()
        };
        let buf = meta_set(&Key::from("🍺"), &flags, b"1");
        assert_eq!(&buf[..], b"ms 8J+Nug== S1 T60 MS b\r\n1\r\n");
    }

    #[test]
    fn test_set_add_mode() {
        let flags = RequestFlags {
            cache_ttl: Some(10),
            set_mode: SetMode::Add,
            ..RequestFlags::default()
        };
        let buf = meta_set(&Key::from("k"), &flags, b"v");
        assert_eq!(&buf[..], b"ms k S1 T10 ME\r\nv\r\n");
    }

    #[test]
    fn test_plain_delete() {
        let buf = meta_delete(&Key::from("k"), &RequestFlags::default());
        assert_eq!(&buf[..], b"md k\r\n");
    }

    #[test]
    fn test_delete_mark_stale_carries_ttl_on_i() {
        let flags = RequestFlags {
            mark_stale: true,
            cache_ttl: Some(30),
            ..RequestFlags::default()
        };
        let buf = meta_delete(&Key::from("k"), &flags);
        assert_eq!(&buf[..], b"md k I30\r\n");
    }

    #[test]
    fn test_delete_with_cas_and_no_reply() {
        let flags = RequestFlags {
            cas_token: Some(7),
            no_reply: true,
            ..RequestFlags::default()
        };
        let buf = meta_delete(&Key::from("k"), &flags);
        assert_eq!(&buf[..], b"md k C7 q\r\n");
    }

    #[test]
    fn test_arithmetic_incr_omits_mode() {
        let flags = RequestFlags {
            ma_delta_value: Some(2),
            return_value: true,
            ..RequestFlags::default()
        };
        let buf = meta_arithmetic(&Key::from("counter"), &flags);
        assert_eq!(&buf[..], b"ma counter D2 v\r\n");
    }

    #[test]
    fn test_arithmetic_decr_with_initialize() {
        let flags = RequestFlags {
            arith_mode: crate::proto::ArithMode::Decr,
            ma_delta_value: Some(1),
            ma_initial_value: Some(10),
            vivify_on_miss_ttl: Some(60),
            return_value: false,
            ..RequestFlags::default()
        };
        let buf = meta_arithmetic(&Key::from("counter"), &flags);
        assert_eq!(&buf[..], b"ma counter MD D1 J10 N60\r\n");
    }

    #[test]
    fn test_multiget_is_one_line_per_key() {
        let keys = [Key::from("a"), Key::from("b c")];
        let flags = RequestFlags {
            return_client_flag: true,
            ..get_flags()
        };
        let buf = meta_multiget(keys.iter(), &flags);
        assert_eq!(&buf[..], b"mg a v f\r\nmg YiBj v f b\r\n");
    }
}
