// src/core/commands/command_spec.rs

//! The static command descriptor table. Every command the client knows about
//! is described once here: arity, behavioural flags, where its keys live and
//! how its reply should be transformed. The dispatcher, the cluster router and
//! the key-prefix logic all consume this table instead of per-command code.

use super::transform::ReplyTransform;
use bitflags::bitflags;
use lazy_static::lazy_static;
use std::collections::HashMap;

bitflags! {
    /// Flags that describe the properties and behavior of a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CommandFlags: u32 {
        /// The command modifies the dataset.
        const WRITE          = 1 << 0;
        /// The command only reads data and may be served by a replica.
        const READONLY       = 1 << 1;
        /// The server may hold the reply back until data arrives.
        const BLOCKING       = 1 << 2;
        /// A command related to the Pub/Sub system.
        const PUBSUB         = 1 << 3;
        /// A command related to transactions (e.g., `MULTI`, `EXEC`).
        const TRANSACTION    = 1 << 4;
        /// An administrative command.
        const ADMIN          = 1 << 5;
        /// A scripting command (e.g., `EVAL`).
        const SCRIPTING      = 1 << 6;
        /// Connection-scoped state (`AUTH`, `SELECT`, ...).
        const CONNECTION     = 1 << 7;
        /// Allowed while the connection is in subscriber mode.
        const SUBSCRIBER     = 1 << 8;
    }
}

/// Where a command's key arguments are located. Positions are indices into the
/// full argument vector, so position `1` is the first argument after the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// The command takes no keys.
    None,
    /// Keys from `first` to `last` inclusive, every `step` arguments.
    /// A negative `last` counts from the end (`-1` is the last argument).
    Range { first: usize, last: isize, step: usize },
    /// A `numkeys` argument at `numkeys_at`, followed by that many keys.
    /// `leading` is an extra key before it (the destination of `ZUNIONSTORE`).
    NumKeys { numkeys_at: usize, leading: bool },
    /// `XREAD`/`XREADGROUP`: the first half of the arguments after `STREAMS`.
    Streams,
}

/// The descriptor of a single command.
#[derive(Debug)]
pub struct CommandSpec {
    /// Uppercase command name.
    pub name: &'static str,
    /// Positive: exact argument count (name included). Negative: minimum.
    pub arity: i64,
    pub flags: CommandFlags,
    pub keys: KeySpec,
    pub transform: ReplyTransform,
}

impl CommandSpec {
    /// Checks an argument count (name included) against the arity.
    pub fn accepts_arity(&self, argc: usize) -> bool {
        let argc = argc as i64;
        if self.arity >= 0 {
            argc == self.arity
        } else {
            argc >= -self.arity
        }
    }
}

const W: CommandFlags = CommandFlags::WRITE;
const R: CommandFlags = CommandFlags::READONLY;
const WB: CommandFlags = CommandFlags::WRITE.union(CommandFlags::BLOCKING);
const RB: CommandFlags = CommandFlags::READONLY.union(CommandFlags::BLOCKING);
const PS: CommandFlags = CommandFlags::PUBSUB.union(CommandFlags::SUBSCRIBER);
const TX: CommandFlags = CommandFlags::TRANSACTION;
const AD: CommandFlags = CommandFlags::ADMIN;
const CN: CommandFlags = CommandFlags::CONNECTION;
const SC: CommandFlags = CommandFlags::SCRIPTING;

const NONE: KeySpec = KeySpec::None;
const K1: KeySpec = KeySpec::Range { first: 1, last: 1, step: 1 };
const K12: KeySpec = KeySpec::Range { first: 1, last: 2, step: 1 };
const KALL: KeySpec = KeySpec::Range { first: 1, last: -1, step: 1 };
const KALL_BUT_LAST: KeySpec = KeySpec::Range { first: 1, last: -2, step: 1 };
const KPAIRS: KeySpec = KeySpec::Range { first: 1, last: -1, step: 2 };

use ReplyTransform::{Boolean, Double, Identity, Map, Status};

macro_rules! spec {
    ($name:literal, $arity:expr, $flags:expr, $keys:expr) => {
        spec!($name, $arity, $flags, $keys, Identity)
    };
    ($name:literal, $arity:expr, $flags:expr, $keys:expr, $transform:expr) => {
        CommandSpec {
            name: $name,
            arity: $arity,
            flags: $flags,
            keys: $keys,
            transform: $transform,
        }
    };
}

static COMMAND_TABLE: &[CommandSpec] = &[
    // --- Connection ---
    spec!("AUTH", -2, CN, NONE, Status),
    spec!("HELLO", -1, CN, NONE),
    spec!("PING", -1, CN.union(CommandFlags::SUBSCRIBER), NONE),
    spec!("ECHO", 2, CN, NONE),
    spec!("SELECT", 2, CN, NONE, Status),
    spec!("QUIT", 1, CN.union(CommandFlags::SUBSCRIBER), NONE, Status),
    spec!("RESET", 1, CN.union(CommandFlags::SUBSCRIBER), NONE, Status),
    spec!("CLIENT", -2, CN.union(AD), NONE),
    spec!("READONLY", 1, CN, NONE, Status),
    spec!("READWRITE", 1, CN, NONE, Status),
    spec!("ASKING", 1, CN, NONE, Status),
    // --- Server ---
    spec!("INFO", -1, AD, NONE),
    spec!("DBSIZE", 1, R, NONE),
    spec!("FLUSHDB", -1, W.union(AD), NONE, Status),
    spec!("FLUSHALL", -1, W.union(AD), NONE, Status),
    spec!("TIME", 1, R, NONE),
    spec!("CONFIG", -2, AD, NONE),
    spec!("CLUSTER", -2, AD, NONE),
    spec!("COMMAND", -1, AD, NONE),
    spec!("WAIT", 3, CommandFlags::BLOCKING, NONE),
    spec!("SAVE", 1, AD, NONE, Status),
    spec!("BGSAVE", -1, AD, NONE),
    spec!("LASTSAVE", 1, R, NONE),
    // --- Generic keyspace ---
    spec!("DEL", -2, W, KALL),
    spec!("UNLINK", -2, W, KALL),
    spec!("EXISTS", -2, R, KALL),
    spec!("TYPE", 2, R, K1),
    spec!("EXPIRE", -3, W, K1, Boolean),
    spec!("PEXPIRE", -3, W, K1, Boolean),
    spec!("EXPIREAT", -3, W, K1, Boolean),
    spec!("PEXPIREAT", -3, W, K1, Boolean),
    spec!("PERSIST", 2, W, K1, Boolean),
    spec!("TTL", 2, R, K1),
    spec!("PTTL", 2, R, K1),
    spec!("RENAME", 3, W, K12, Status),
    spec!("RENAMENX", 3, W, K12, Boolean),
    spec!("KEYS", 2, R, NONE),
    spec!("SCAN", -2, R, NONE),
    spec!("RANDOMKEY", 1, R, NONE),
    spec!("DUMP", 2, R, K1),
    spec!("RESTORE", -4, W, K1, Status),
    spec!("TOUCH", -2, R, KALL),
    spec!("COPY", -3, W, K12, Boolean),
    spec!("SORT", -2, W, K1),
    spec!("SORT_RO", -2, R, K1),
    spec!("OBJECT", -2, R, KeySpec::Range { first: 2, last: 2, step: 1 }),
    // --- Strings ---
    spec!("GET", 2, R, K1),
    spec!("SET", -3, W, K1),
    spec!("SETNX", 3, W, K1, Boolean),
    spec!("SETEX", 4, W, K1, Status),
    spec!("PSETEX", 4, W, K1, Status),
    spec!("GETSET", 3, W, K1),
    spec!("GETDEL", 2, W, K1),
    spec!("GETEX", -2, W, K1),
    spec!("MGET", -2, R, KALL),
    spec!("MSET", -3, W, KPAIRS, Status),
    spec!("MSETNX", -3, W, KPAIRS, Boolean),
    spec!("APPEND", 3, W, K1),
    spec!("STRLEN", 2, R, K1),
    spec!("INCR", 2, W, K1),
    spec!("DECR", 2, W, K1),
    spec!("INCRBY", 3, W, K1),
    spec!("DECRBY", 3, W, K1),
    spec!("INCRBYFLOAT", 3, W, K1, Double),
    spec!("GETRANGE", 4, R, K1),
    spec!("SETRANGE", 4, W, K1),
    spec!("GETBIT", 3, R, K1),
    spec!("SETBIT", 4, W, K1),
    spec!("BITCOUNT", -2, R, K1),
    spec!("BITPOS", -3, R, K1),
    spec!("BITOP", -4, W, KeySpec::Range { first: 2, last: -1, step: 1 }),
    // --- Hashes ---
    spec!("HGET", 3, R, K1),
    spec!("HSET", -4, W, K1),
    spec!("HSETNX", 4, W, K1, Boolean),
    spec!("HMSET", -4, W, K1, Status),
    spec!("HMGET", -3, R, K1),
    spec!("HGETALL", 2, R, K1, Map),
    spec!("HDEL", -3, W, K1),
    spec!("HEXISTS", 3, R, K1, Boolean),
    spec!("HLEN", 2, R, K1),
    spec!("HKEYS", 2, R, K1),
    spec!("HVALS", 2, R, K1),
    spec!("HSTRLEN", 3, R, K1),
    spec!("HINCRBY", 4, W, K1),
    spec!("HINCRBYFLOAT", 4, W, K1, Double),
    spec!("HRANDFIELD", -2, R, K1),
    spec!("HSCAN", -3, R, K1),
    // --- Lists ---
    spec!("LPUSH", -3, W, K1),
    spec!("RPUSH", -3, W, K1),
    spec!("LPUSHX", -3, W, K1),
    spec!("RPUSHX", -3, W, K1),
    spec!("LPOP", -2, W, K1),
    spec!("RPOP", -2, W, K1),
    spec!("LLEN", 2, R, K1),
    spec!("LRANGE", 4, R, K1),
    spec!("LINDEX", 3, R, K1),
    spec!("LSET", 4, W, K1, Status),
    spec!("LTRIM", 4, W, K1, Status),
    spec!("LREM", 4, W, K1),
    spec!("LINSERT", 5, W, K1),
    spec!("LPOS", -3, R, K1),
    spec!("RPOPLPUSH", 3, W, K12),
    spec!("LMOVE", 5, W, K12),
    spec!("LMPOP", -4, W, KeySpec::NumKeys { numkeys_at: 1, leading: false }),
    spec!("BLPOP", -3, WB, KALL_BUT_LAST),
    spec!("BRPOP", -3, WB, KALL_BUT_LAST),
    spec!("BRPOPLPUSH", 4, WB, K12),
    spec!("BLMOVE", 6, WB, K12),
    spec!("BLMPOP", -5, WB, KeySpec::NumKeys { numkeys_at: 2, leading: false }),
    // --- Sets ---
    spec!("SADD", -3, W, K1),
    spec!("SREM", -3, W, K1),
    spec!("SMEMBERS", 2, R, K1),
    spec!("SISMEMBER", 3, R, K1, Boolean),
    spec!("SMISMEMBER", -3, R, K1),
    spec!("SCARD", 2, R, K1),
    spec!("SPOP", -2, W, K1),
    spec!("SRANDMEMBER", -2, R, K1),
    spec!("SMOVE", 4, W, K12, Boolean),
    spec!("SINTER", -2, R, KALL),
    spec!("SUNION", -2, R, KALL),
    spec!("SDIFF", -2, R, KALL),
    spec!("SINTERSTORE", -3, W, KALL),
    spec!("SUNIONSTORE", -3, W, KALL),
    spec!("SDIFFSTORE", -3, W, KALL),
    spec!("SINTERCARD", -3, R, KeySpec::NumKeys { numkeys_at: 1, leading: false }),
    spec!("SSCAN", -3, R, K1),
    // --- Sorted sets ---
    spec!("ZADD", -4, W, K1),
    spec!("ZREM", -3, W, K1),
    spec!("ZSCORE", 3, R, K1, Double),
    spec!("ZMSCORE", -3, R, K1),
    spec!("ZINCRBY", 4, W, K1, Double),
    spec!("ZCARD", 2, R, K1),
    spec!("ZCOUNT", 4, R, K1),
    spec!("ZLEXCOUNT", 4, R, K1),
    spec!("ZRANK", -3, R, K1),
    spec!("ZREVRANK", -3, R, K1),
    spec!("ZRANGE", -4, R, K1),
    spec!("ZREVRANGE", -4, R, K1),
    spec!("ZRANGEBYSCORE", -4, R, K1),
    spec!("ZREVRANGEBYSCORE", -4, R, K1),
    spec!("ZRANGEBYLEX", -4, R, K1),
    spec!("ZREMRANGEBYSCORE", 4, W, K1),
    spec!("ZREMRANGEBYRANK", 4, W, K1),
    spec!("ZREMRANGEBYLEX", 4, W, K1),
    spec!("ZPOPMIN", -2, W, K1),
    spec!("ZPOPMAX", -2, W, K1),
    spec!("BZPOPMIN", -3, WB, KALL_BUT_LAST),
    spec!("BZPOPMAX", -3, WB, KALL_BUT_LAST),
    spec!("ZUNIONSTORE", -4, W, KeySpec::NumKeys { numkeys_at: 2, leading: true }),
    spec!("ZINTERSTORE", -4, W, KeySpec::NumKeys { numkeys_at: 2, leading: true }),
    spec!("ZDIFFSTORE", -4, W, KeySpec::NumKeys { numkeys_at: 2, leading: true }),
    spec!("ZUNION", -3, R, KeySpec::NumKeys { numkeys_at: 1, leading: false }),
    spec!("ZINTER", -3, R, KeySpec::NumKeys { numkeys_at: 1, leading: false }),
    spec!("ZDIFF", -3, R, KeySpec::NumKeys { numkeys_at: 1, leading: false }),
    spec!("ZSCAN", -3, R, K1),
    // --- Streams ---
    spec!("XADD", -5, W, K1),
    spec!("XLEN", 2, R, K1),
    spec!("XRANGE", -4, R, K1),
    spec!("XREVRANGE", -4, R, K1),
    spec!("XDEL", -3, W, K1),
    spec!("XTRIM", -4, W, K1),
    spec!("XACK", -4, W, K1),
    spec!("XREAD", -4, R, KeySpec::Streams),
    spec!("XREADGROUP", -7, W, KeySpec::Streams),
    spec!("XGROUP", -2, W, KeySpec::Range { first: 2, last: 2, step: 1 }),
    // --- HyperLogLog ---
    spec!("PFADD", -2, W, K1, Boolean),
    spec!("PFCOUNT", -2, R, KALL),
    spec!("PFMERGE", -2, W, KALL, Status),
    // --- Pub/Sub ---
    spec!("SUBSCRIBE", -2, PS, NONE),
    spec!("PSUBSCRIBE", -2, PS, NONE),
    spec!("UNSUBSCRIBE", -1, PS, NONE),
    spec!("PUNSUBSCRIBE", -1, PS, NONE),
    spec!("PUBLISH", 3, CommandFlags::PUBSUB, NONE),
    spec!("PUBSUB", -2, CommandFlags::PUBSUB, NONE),
    // --- Transactions ---
    spec!("MULTI", 1, TX, NONE, Status),
    spec!("EXEC", 1, TX, NONE),
    spec!("DISCARD", 1, TX, NONE, Status),
    spec!("WATCH", -2, TX, KALL, Status),
    spec!("UNWATCH", 1, TX, NONE, Status),
    // --- Scripting (routing only; no script cache here) ---
    spec!("EVAL", -3, SC, KeySpec::NumKeys { numkeys_at: 2, leading: false }),
    spec!("EVALSHA", -3, SC, KeySpec::NumKeys { numkeys_at: 2, leading: false }),
    spec!("SCRIPT", -2, SC, NONE),
];

lazy_static! {
    static ref BY_NAME: HashMap<&'static str, &'static CommandSpec> =
        COMMAND_TABLE.iter().map(|spec| (spec.name, spec)).collect();
}

/// Looks up a command descriptor by name, case-insensitively.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    if name.bytes().any(|b| b.is_ascii_lowercase()) {
        BY_NAME.get(name.to_ascii_uppercase().as_str()).copied()
    } else {
        BY_NAME.get(name).copied()
    }
}

/// All command names in the table.
pub fn builtin_commands() -> impl Iterator<Item = &'static str> {
    COMMAND_TABLE.iter().map(|spec| spec.name)
}
