//! Wire-level request and response records for the meta protocol.
//!
//! A request is a single line — verb, key, single-letter flag tokens —
//! optionally followed by a payload block. A reply is a terminal line
//! (`HD`, `NS`, `EX`, `EN`, `NF`, error lines) or a `VA <size>` header
//! followed by exactly `size` payload bytes. Encoding lives in
//! [`encode`], parsing in [`parse`]; this module holds the typed records
//! both sides share.

pub(crate) mod encode;
pub(crate) mod parse;

/// Storage mode for `ms` (`M` token). CAS writes are expressed by a
/// `cas_token` alongside any mode, not by a mode of their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetMode {
    /// Unconditional store (`MS`).
    #[default]
    Set,
    /// Store only if absent (`ME`).
    Add,
    /// Store only if present (`MR`).
    Replace,
    /// Append to an existing value (`MA`).
    Append,
    /// Prepend to an existing value (`MP`).
    Prepend,
}

impl SetMode {
    pub(crate) fn token(self) -> u8 {
        match self {
            SetMode::Set => b'S',
            SetMode::Add => b'E',
            SetMode::Replace => b'R',
            SetMode::Append => b'A',
            SetMode::Prepend => b'P',
        }
    }
}

/// Direction for `ma` (`M` token).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArithMode {
    /// Increment (server default, no token written).
    #[default]
    Incr,
    /// Decrement (`MD`).
    Decr,
}

/// Request flags, one field per protocol flag the client can send.
/// Which fields a given verb consumes is the encoder's business; unused
/// fields are ignored.
#[derive(Clone, Debug)]
pub struct RequestFlags {
    /// `q` — suppress the reply; the executor synthesizes a Success.
    pub no_reply: bool,
    /// `f` — echo the stored client flag back on a read.
    pub return_client_flag: bool,
    /// `c` — return the CAS token.
    pub return_cas_token: bool,
    /// `v` — return the value payload.
    pub return_value: bool,
    /// `t` — return remaining TTL.
    pub return_ttl: bool,
    /// `s` — return stored size.
    pub return_size: bool,
    /// `l` — return seconds since last access.
    pub return_last_access: bool,
    /// `h` — return whether the item was hit before.
    pub return_fetched: bool,
    /// `k` — echo the key back.
    pub return_key: bool,
    /// `u` — don't bump the LRU on this read.
    pub no_update_lru: bool,
    /// `I` — mark stale instead of removing (`md`), or invalidate on CAS
    /// mismatch (`ms`).
    pub mark_stale: bool,
    /// `T` — TTL to set or touch; on `md` with `mark_stale` it rides the
    /// `I<ttl>` token instead.
    pub cache_ttl: Option<u32>,
    /// `R` — recache window: a read with remaining TTL below this makes
    /// exactly one caller the refresh winner.
    pub recache_ttl: Option<u32>,
    /// `N` — vivify a placeholder with this TTL on miss (leases).
    pub vivify_on_miss_ttl: Option<u32>,
    /// `F` — client flag stored with the value.
    pub client_flag: Option<u32>,
    /// `J` — seed value for arithmetic auto-vivify.
    pub ma_initial_value: Option<u64>,
    /// `D` — arithmetic delta.
    pub ma_delta_value: Option<u64>,
    /// `C` — compare-and-swap token.
    pub cas_token: Option<u64>,
    /// `O` — opaque token echoed back verbatim.
    pub opaque: Option<Vec<u8>>,
    /// `M` on `ms`.
    pub set_mode: SetMode,
    /// `M` on `ma`.
    pub arith_mode: ArithMode,
}

impl Default for RequestFlags {
    fn default() -> Self {
        RequestFlags {
            no_reply: false,
            return_client_flag: false,
            return_cas_token: false,
            return_value: true,
            return_ttl: false,
            return_size: false,
            return_last_access: false,
            return_fetched: false,
            return_key: false,
            no_update_lru: false,
            mark_stale: false,
            cache_ttl: None,
            recache_ttl: None,
            vivify_on_miss_ttl: None,
            client_flag: None,
            ma_initial_value: None,
            ma_delta_value: None,
            cas_token: None,
            opaque: None,
            set_mode: SetMode::Set,
            arith_mode: ArithMode::Incr,
        }
    }
}

/// Flags parsed off a reply line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseFlags {
    /// `c` — CAS token.
    pub cas_token: Option<u64>,
    /// `h` — item was hit before.
    pub fetched: Option<bool>,
    /// `l` — seconds since last access.
    pub last_access: Option<u64>,
    /// `t` — remaining TTL, `-1` for never-expires.
    pub ttl: Option<i64>,
    /// `f` — stored client flag.
    pub client_flag: Option<u32>,
    /// `W` (true) / `Z` (false) — recache/lease win marker.
    pub win: Option<bool>,
    /// `X` — value is stale.
    pub stale: bool,
    /// `s` — stored size.
    pub real_size: Option<u64>,
    /// `O` — opaque token echo.
    pub opaque: Option<Vec<u8>>,
    /// `k` — key echo.
    pub key: Option<Vec<u8>>,
}

/// One parsed reply, as it came off the wire.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetaReply {
    /// `HD`.
    Success(ResponseFlags),
    /// `VA <size>` plus payload.
    Value {
        flags: ResponseFlags,
        data: Vec<u8>,
    },
    /// `EN` or `NF`.
    Miss(ResponseFlags),
    /// `NS`.
    NotStored(ResponseFlags),
    /// `EX`.
    Conflict(ResponseFlags),
    /// `SERVER_ERROR <msg>` — reported, but the socket stays clean.
    ServerError(String),
}

/// Typed result of a read-class operation.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadResponse {
    /// Key absent (or vivified loser with no data to give).
    Miss,
    /// Key present with payload.
    Value {
        /// Reply flags.
        flags: ResponseFlags,
        /// Payload bytes, owned by the caller.
        data: Vec<u8>,
    },
    /// Flag-only hit (no `v` requested, e.g. touch).
    Success {
        /// Reply flags.
        flags: ResponseFlags,
    },
}

/// Typed result of `ma`, which reports write-style outcomes but can
/// also hand back the post-op value when `v` was requested.
#[derive(Clone, Debug, PartialEq)]
pub enum ArithmeticResponse {
    /// Applied; `value` holds the decimal result when requested.
    Success {
        /// Reply flags.
        flags: ResponseFlags,
        /// Decimal value bytes, present iff `v` was sent.
        value: Option<Vec<u8>>,
    },
    /// The operation was refused (`NS`).
    NotStored,
    /// CAS mismatch (`EX`).
    Conflict,
    /// Key absent and no auto-vivify requested (`NF`).
    Miss,
}

/// Typed result of a write-class operation. Conflict and NotStored are
/// ordinary results here, not errors.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteResponse {
    /// Stored / deleted / applied.
    Success {
        /// Reply flags.
        flags: ResponseFlags,
    },
    /// Store-mode precondition failed (`NS`).
    NotStored,
    /// CAS mismatch (`EX`).
    Conflict,
    /// Key absent (`NF`).
    Miss,
}
