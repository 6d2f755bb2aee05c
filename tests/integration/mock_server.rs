// tests/integration/mock_server.rs

//! An in-process RESP server for integration tests, built on the crate's own
//! codec. It keeps a small keyspace (strings, hashes and lists), supports
//! MULTI/EXEC/WATCH, pub/sub, SCAN/HSCAN and AUTH, and can act as one node of
//! a cluster whose slot layout is shared between several mock servers.
//!
//! Tests can make it answer a command with an error for a while, hold a
//! reply back, or stop listening altogether.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use spinel_client::core::cluster::get_slot;
use spinel_client::core::protocol::{RespFrame, RespFrameCodec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::Framed;

/// Slot ownership shared by the servers of one mock cluster.
#[derive(Default)]
pub struct ClusterLayout {
    owners: Mutex<Vec<(u16, u16, u16)>>,
    /// slot -> port of the node importing it.
    migrating: Mutex<HashMap<u16, u16>>,
}

impl ClusterLayout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the whole layout with `(start, end, port)` ranges.
    pub fn assign(&self, ranges: Vec<(u16, u16, u16)>) {
        *self.owners.lock() = ranges;
    }

    /// Moves a single slot to another node.
    pub fn move_slot(&self, slot: u16, port: u16) {
        let mut owners = self.owners.lock();
        let mut next = Vec::new();
        for &(start, end, owner) in owners.iter() {
            if slot < start || slot > end {
                next.push((start, end, owner));
                continue;
            }
            if start < slot {
                next.push((start, slot - 1, owner));
            }
            if slot < end {
                next.push((slot + 1, end, owner));
            }
        }
        next.push((slot, slot, port));
        next.sort();
        *owners = next;
    }

    pub fn start_migration(&self, slot: u16, to_port: u16) {
        self.migrating.lock().insert(slot, to_port);
    }

    pub fn owner(&self, slot: u16) -> Option<u16> {
        self.owners
            .lock()
            .iter()
            .find(|(start, end, _)| (*start..=*end).contains(&slot))
            .map(|(_, _, port)| *port)
    }

    fn migration_target(&self, slot: u16) -> Option<u16> {
        self.migrating.lock().get(&slot).copied()
    }

    fn slots_reply(&self) -> RespFrame {
        let owners = self.owners.lock();
        RespFrame::Array(
            owners
                .iter()
                .map(|&(start, end, port)| {
                    RespFrame::Array(vec![
                        RespFrame::Integer(start as i64),
                        RespFrame::Integer(end as i64),
                        RespFrame::Array(vec![
                            bulk("127.0.0.1"),
                            RespFrame::Integer(port as i64),
                            bulk(&format!("node-{port}")),
                        ]),
                    ])
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    Hash(BTreeMap<Bytes, Bytes>),
    List(Vec<Bytes>),
}

struct Subscriber {
    tx: mpsc::UnboundedSender<RespFrame>,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

#[derive(Default)]
struct Session {
    multi: Option<Vec<Vec<Bytes>>>,
    multi_dirty: bool,
    watched: Vec<(Bytes, u64)>,
    asking: bool,
    authenticated: bool,
}

struct Shared {
    port: u16,
    kv: Mutex<HashMap<Bytes, Value>>,
    versions: Mutex<HashMap<Bytes, u64>>,
    version_counter: AtomicU64,
    subscribers: Mutex<HashMap<usize, Subscriber>>,
    log: Mutex<Vec<Vec<String>>>,
    accepted: AtomicUsize,
    next_id: AtomicUsize,
    kill: broadcast::Sender<()>,
    stop: watch::Sender<bool>,
    cluster: Option<Arc<ClusterLayout>>,
    /// command -> (error reply, remaining uses)
    failures: Mutex<HashMap<String, (String, usize)>>,
    /// command -> delay before its next reply
    stalls: Mutex<HashMap<String, Duration>>,
    password: Mutex<Option<String>>,
}

/// A running mock server. Dropping it does not stop the listener; tests are
/// short-lived.
#[derive(Clone)]
pub struct MockServer {
    shared: Arc<Shared>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// A server acting as one node of `layout`.
    pub async fn start_clustered(layout: Arc<ClusterLayout>) -> Self {
        Self::spawn(Some(layout)).await
    }

    async fn spawn(cluster: Option<Arc<ClusterLayout>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (kill, _) = broadcast::channel(4);
        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::new(Shared {
            port,
            kv: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            version_counter: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            kill,
            stop,
            cluster,
            failures: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            password: Mutex::new(None),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(accept_shared.clone(), socket));
                    }
                }
            }
        });
        Self { shared }
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.shared.port)
    }

    /// Number of accepted TCP connections so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Drops every open client connection.
    pub fn kill_connections(&self) {
        let _ = self.shared.kill.send(());
    }

    /// Closes the listener and every connection. The port refuses
    /// connections from then on.
    pub fn shutdown(&self) {
        let _ = self.shared.stop.send(true);
        self.kill_connections();
    }

    /// Answers the next `times` commands named `name` with `error`.
    pub fn fail_next(&self, name: &str, error: &str, times: usize) {
        self.shared
            .failures
            .lock()
            .insert(name.to_ascii_uppercase(), (error.to_string(), times));
    }

    /// Holds back the reply to the next command named `name`. Killing the
    /// connections cuts the wait short without replying.
    pub fn stall_next(&self, name: &str, delay: Duration) {
        self.shared
            .stalls
            .lock()
            .insert(name.to_ascii_uppercase(), delay);
    }

    /// Rejects every command but AUTH until the connection authenticates.
    pub fn require_password(&self, password: &str) {
        *self.shared.password.lock() = Some(password.to_string());
    }

    /// How many times a command with this name (and first argument, if
    /// given) was received.
    pub fn count(&self, name: &str, first_arg: Option<&str>) -> usize {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|c| {
                c[0] == name && first_arg.is_none_or(|a| c.get(1).map(String::as_str) == Some(a))
            })
            .count()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().clone()
    }

    /// Writes a string value directly, bypassing the protocol.
    pub fn insert(&self, key: &str, value: &str) {
        self.shared.kv.lock().insert(
            Bytes::copy_from_slice(key.as_bytes()),
            Value::Str(Bytes::copy_from_slice(value.as_bytes())),
        );
        self.shared.bump(key.as_bytes());
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        match self.shared.kv.lock().get(key.as_bytes()) {
            Some(Value::Str(b)) => Some(b.clone()),
            _ => None,
        }
    }
}

async fn serve(shared: Arc<Shared>, socket: TcpStream) {
    let mut framed = Framed::new(socket, RespFrameCodec);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let mut kill = shared.kill.subscribe();
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let mut session = Session::default();

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            Some(frame) = push_rx.recv() => {
                if framed.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = framed.next() => {
                let Some(Ok(RespFrame::Array(parts))) = incoming else { break };
                let args: Vec<Bytes> = parts
                    .iter()
                    .filter_map(|p| p.as_bytes().map(Bytes::copy_from_slice))
                    .collect();
                if args.is_empty() {
                    continue;
                }
                let stall = shared.stalls.lock().remove(&text(&args[0]).to_ascii_uppercase());
                let (replies, close) = shared.handle(id, &push_tx, &mut session, args);
                if let Some(delay) = stall {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = kill.recv() => break,
                    }
                }
                let mut failed = false;
                for reply in replies {
                    if framed.feed(reply).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed || SinkExt::<RespFrame>::flush(&mut framed).await.is_err() || close {
                    break;
                }
            }
        }
    }
    shared.subscribers.lock().remove(&id);
}

fn bulk(s: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".into())
}

fn text(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn glob_match(pattern: &[u8], s: &[u8]) -> bool {
    match (pattern.first(), s.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], s) || (!s.is_empty() && glob_match(pattern, &s[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &s[1..]),
        (Some(a), Some(b)) if a == b => glob_match(&pattern[1..], &s[1..]),
        _ => false,
    }
}

fn is_keyed(name: &str) -> bool {
    matches!(
        name,
        "GET" | "SET" | "INCR" | "INCRBY" | "DEL" | "EXISTS" | "HSET" | "HGET" | "HGETALL"
            | "WATCH" | "HSCAN" | "PEXPIRE" | "PTTL" | "RPUSH" | "LRANGE"
    )
}

/// `[... MATCH p COUNT n ...]` options of a SCAN-family command.
fn scan_options(args: &[Bytes]) -> (Option<Bytes>, usize) {
    let mut pattern = None;
    let mut count = 10;
    let mut i = 0;
    while i + 1 < args.len() {
        match text(&args[i]).to_ascii_uppercase().as_str() {
            "MATCH" => pattern = Some(args[i + 1].clone()),
            "COUNT" => count = text(&args[i + 1]).parse().unwrap_or(10),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    (pattern, count.max(1))
}

fn scan_page(items: Vec<Bytes>, cursor: usize, pattern: Option<&Bytes>, count: usize) -> RespFrame {
    let end = (cursor + count).min(items.len());
    let page: Vec<RespFrame> = items[cursor.min(end)..end]
        .iter()
        .filter(|k| pattern.is_none_or(|p| glob_match(p, k)))
        .map(|k| RespFrame::BulkString(k.clone()))
        .collect();
    let next = if end >= items.len() { 0 } else { end };
    RespFrame::Array(vec![bulk(&next.to_string()), RespFrame::Array(page)])
}

impl Shared {
    fn bump(&self, key: &[u8]) {
        let version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.versions
            .lock()
            .insert(Bytes::copy_from_slice(key), version);
    }

    fn version(&self, key: &[u8]) -> u64 {
        self.versions.lock().get(key).copied().unwrap_or(0)
    }

    /// A MOVED/ASK reply if this node must not serve `key`.
    fn redirect(&self, session: &Session, key: &[u8]) -> Option<RespFrame> {
        let layout = self.cluster.as_ref()?;
        let slot = get_slot(key);
        let owner = layout.owner(slot)?;
        if owner != self.port {
            if session.asking && layout.migration_target(slot) == Some(self.port) {
                return None;
            }
            return Some(RespFrame::error(format!("MOVED {slot} 127.0.0.1:{owner}")));
        }
        if let Some(target) = layout.migration_target(slot)
            && !self.kv.lock().contains_key(key)
        {
            return Some(RespFrame::error(format!("ASK {slot} 127.0.0.1:{target}")));
        }
        None
    }

    fn handle(
        &self,
        id: usize,
        push_tx: &mpsc::UnboundedSender<RespFrame>,
        session: &mut Session,
        args: Vec<Bytes>,
    ) -> (Vec<RespFrame>, bool) {
        let name = text(&args[0]).to_ascii_uppercase();
        let mut entry = vec![name.clone()];
        entry.extend(args[1..].iter().map(|a| text(a)));
        self.log.lock().push(entry);

        if name == "AUTH" {
            let expected = self.password.lock().clone();
            return match expected {
                None => (
                    vec![RespFrame::error(
                        "ERR AUTH <password> called without any password configured",
                    )],
                    false,
                ),
                Some(password) if args.last().is_some_and(|a| &a[..] == password.as_bytes()) => {
                    session.authenticated = true;
                    (vec![ok()], false)
                }
                Some(_) => (
                    vec![RespFrame::error(
                        "WRONGPASS invalid username-password pair or user is disabled.",
                    )],
                    false,
                ),
            };
        }
        if self.password.lock().is_some() && !session.authenticated && name != "QUIT" {
            return (vec![RespFrame::error("NOAUTH Authentication required.")], false);
        }

        let failure = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&name) {
                Some((error, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(error.clone())
                }
                _ => None,
            }
        };
        if let Some(error) = failure {
            if session.multi.is_some() {
                session.multi_dirty = true;
            }
            return (vec![RespFrame::error(error)], false);
        }

        // Like a real node, ASKING covers a whole MULTI block.
        let asking = if session.multi.is_some() || name == "MULTI" {
            session.asking
        } else {
            std::mem::take(&mut session.asking)
        };
        if name == "ASKING" {
            session.asking = true;
            return (vec![ok()], false);
        }
        if is_keyed(&name)
            && let Some(key) = args.get(1)
        {
            let lookup = Session {
                asking,
                ..Session::default()
            };
            if let Some(redirect) = self.redirect(&lookup, key) {
                if session.multi.is_some() {
                    session.multi_dirty = true;
                }
                return (vec![redirect], false);
            }
        }

        match name.as_str() {
            "QUIT" => return (vec![ok()], true),
            "MULTI" => {
                session.multi = Some(Vec::new());
                session.multi_dirty = false;
                return (vec![ok()], false);
            }
            "DISCARD" => {
                session.multi = None;
                session.asking = false;
                session.watched.clear();
                return (vec![ok()], false);
            }
            "WATCH" => {
                for key in &args[1..] {
                    session.watched.push((key.clone(), self.version(key)));
                }
                return (vec![ok()], false);
            }
            "UNWATCH" => {
                session.watched.clear();
                return (vec![ok()], false);
            }
            "EXEC" => {
                let Some(queued) = session.multi.take() else {
                    return (vec![RespFrame::error("ERR EXEC without MULTI")], false);
                };
                session.asking = false;
                let watched = std::mem::take(&mut session.watched);
                if std::mem::take(&mut session.multi_dirty) {
                    return (
                        vec![RespFrame::error(
                            "EXECABORT Transaction discarded because of previous errors.",
                        )],
                        false,
                    );
                }
                if watched.iter().any(|(k, v)| self.version(k) != *v) {
                    return (vec![RespFrame::NullArray], false);
                }
                let replies = queued.into_iter().map(|c| self.execute(&c)).collect();
                return (vec![RespFrame::Array(replies)], false);
            }
            _ => {}
        }

        if let Some(queue) = session.multi.as_mut() {
            if self.execute_is_known(&name) {
                queue.push(args);
                return (vec![RespFrame::SimpleString("QUEUED".into())], false);
            }
            session.multi_dirty = true;
            return (
                vec![RespFrame::error(format!("ERR unknown command '{name}'"))],
                false,
            );
        }

        match name.as_str() {
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let pattern = name == "PSUBSCRIBE";
                let mut subs = self.subscribers.lock();
                let sub = subs.entry(id).or_insert_with(|| Subscriber {
                    tx: push_tx.clone(),
                    channels: HashSet::new(),
                    patterns: HashSet::new(),
                });
                let mut replies = Vec::new();
                for target in &args[1..] {
                    if pattern {
                        sub.patterns.insert(target.clone());
                    } else {
                        sub.channels.insert(target.clone());
                    }
                    let count = (sub.channels.len() + sub.patterns.len()) as i64;
                    replies.push(RespFrame::Array(vec![
                        bulk(&name.to_ascii_lowercase()),
                        RespFrame::BulkString(target.clone()),
                        RespFrame::Integer(count),
                    ]));
                }
                (replies, false)
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let pattern = name == "PUNSUBSCRIBE";
                let kind = bulk(&name.to_ascii_lowercase());
                let mut subs = self.subscribers.lock();
                let Some(sub) = subs.get_mut(&id) else {
                    return (
                        vec![RespFrame::Array(vec![kind, RespFrame::Null, RespFrame::Integer(0)])],
                        false,
                    );
                };
                let targets: Vec<Bytes> = if args.len() > 1 {
                    args[1..].to_vec()
                } else if pattern {
                    sub.patterns.iter().cloned().collect()
                } else {
                    sub.channels.iter().cloned().collect()
                };
                let mut replies = Vec::new();
                for target in &targets {
                    if pattern {
                        sub.patterns.remove(target);
                    } else {
                        sub.channels.remove(target);
                    }
                    let count = (sub.channels.len() + sub.patterns.len()) as i64;
                    replies.push(RespFrame::Array(vec![
                        kind.clone(),
                        RespFrame::BulkString(target.clone()),
                        RespFrame::Integer(count),
                    ]));
                }
                if replies.is_empty() {
                    let count = (sub.channels.len() + sub.patterns.len()) as i64;
                    replies.push(RespFrame::Array(vec![
                        kind,
                        RespFrame::Null,
                        RespFrame::Integer(count),
                    ]));
                }
                (replies, false)
            }
            _ => (vec![self.execute(&args)], false),
        }
    }

    fn execute_is_known(&self, name: &str) -> bool {
        !matches!(self.execute_named(name, &[]), UnknownOr::Unknown)
    }

    fn execute(&self, args: &[Bytes]) -> RespFrame {
        let name = text(&args[0]).to_ascii_uppercase();
        match self.execute_named(&name, args) {
            UnknownOr::Reply(frame) => frame,
            UnknownOr::Unknown => RespFrame::error(format!("ERR unknown command '{name}'")),
        }
    }

    fn execute_named(&self, name: &str, args: &[Bytes]) -> UnknownOr {
        // An empty `args` only asks whether the command is known.
        if args.is_empty() {
            return match name {
                "PING" | "ECHO" | "INFO" | "AUTH" | "SELECT" | "CLIENT" | "READONLY" | "GET"
                | "SET" | "INCR" | "INCRBY" | "DEL" | "EXISTS" | "HSET" | "HGET" | "HGETALL"
                | "PUBLISH" | "SCAN" | "HSCAN" | "CLUSTER" | "PEXPIRE" | "PTTL" | "RPUSH"
                | "LRANGE" => {
                    UnknownOr::Reply(RespFrame::Null)
                }
                _ => UnknownOr::Unknown,
            };
        }
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let wrong_type = || {
            RespFrame::error("WRONGTYPE Operation against a key holding the wrong kind of value")
        };

        let reply = match name {
            "PING" => match args.get(1) {
                Some(msg) => RespFrame::BulkString(msg.clone()),
                None => RespFrame::SimpleString("PONG".into()),
            },
            "ECHO" => RespFrame::BulkString(arg(1)),
            "INFO" => bulk("# Server\r\nredis_version:7.2.0\r\nloading:0\r\n"),
            "SELECT" | "CLIENT" | "READONLY" => ok(),
            "GET" => match self.kv.lock().get(&arg(1)) {
                Some(Value::Str(v)) => RespFrame::BulkString(v.clone()),
                Some(_) => wrong_type(),
                None => RespFrame::Null,
            },
            "SET" => {
                let nx = args.iter().skip(3).any(|a| a.eq_ignore_ascii_case(b"NX"));
                let mut kv = self.kv.lock();
                if nx && kv.contains_key(&arg(1)) {
                    RespFrame::Null
                } else {
                    kv.insert(arg(1), Value::Str(arg(2)));
                    drop(kv);
                    self.bump(&arg(1));
                    ok()
                }
            }
            "INCR" | "INCRBY" => {
                let delta = if name == "INCR" {
                    1
                } else {
                    match text(&arg(2)).parse::<i64>() {
                        Ok(d) => d,
                        Err(_) => {
                            return UnknownOr::Reply(RespFrame::error(
                                "ERR value is not an integer or out of range",
                            ));
                        }
                    }
                };
                let mut kv = self.kv.lock();
                let current = match kv.get(&arg(1)) {
                    Some(Value::Str(v)) => match text(v).parse::<i64>() {
                        Ok(n) => n,
                        Err(_) => {
                            return UnknownOr::Reply(RespFrame::error(
                                "ERR value is not an integer or out of range",
                            ));
                        }
                    },
                    Some(_) => return UnknownOr::Reply(wrong_type()),
                    None => 0,
                };
                let next = current + delta;
                kv.insert(arg(1), Value::Str(Bytes::from(next.to_string())));
                drop(kv);
                self.bump(&arg(1));
                RespFrame::Integer(next)
            }
            "DEL" => {
                let mut removed = 0;
                for key in &args[1..] {
                    if self.kv.lock().remove(key).is_some() {
                        removed += 1;
                        self.bump(key);
                    }
                }
                RespFrame::Integer(removed)
            }
            "EXISTS" => {
                let kv = self.kv.lock();
                RespFrame::Integer(args[1..].iter().filter(|k| kv.contains_key(*k)).count() as i64)
            }
            "PEXPIRE" => RespFrame::Integer(i64::from(self.kv.lock().contains_key(&arg(1)))),
            "PTTL" => {
                RespFrame::Integer(if self.kv.lock().contains_key(&arg(1)) { -1 } else { -2 })
            }
            "HSET" => {
                let mut kv = self.kv.lock();
                let entry = kv
                    .entry(arg(1))
                    .or_insert_with(|| Value::Hash(BTreeMap::new()));
                let Value::Hash(hash) = entry else {
                    return UnknownOr::Reply(wrong_type());
                };
                let mut added = 0;
                for pair in args[2..].chunks(2) {
                    if let [field, value] = pair
                        && hash.insert(field.clone(), value.clone()).is_none()
                    {
                        added += 1;
                    }
                }
                drop(kv);
                self.bump(&arg(1));
                RespFrame::Integer(added)
            }
            "RPUSH" => {
                let mut kv = self.kv.lock();
                let entry = kv.entry(arg(1)).or_insert_with(|| Value::List(Vec::new()));
                let Value::List(list) = entry else {
                    return UnknownOr::Reply(wrong_type());
                };
                list.extend(args[2..].iter().cloned());
                let len = list.len() as i64;
                drop(kv);
                self.bump(&arg(1));
                RespFrame::Integer(len)
            }
            "LRANGE" => match self.kv.lock().get(&arg(1)) {
                Some(Value::List(list)) => {
                    let len = list.len() as i64;
                    let index = |i: usize| {
                        let i: i64 = text(&arg(i)).parse().unwrap_or(0);
                        if i < 0 { (len + i).max(0) } else { i.min(len) }
                    };
                    let (start, stop) = (index(2), (index(3) + 1).min(len));
                    let items = list
                        .iter()
                        .take(stop.max(0) as usize)
                        .skip(start as usize)
                        .map(|v| RespFrame::BulkString(v.clone()))
                        .collect();
                    RespFrame::Array(items)
                }
                Some(_) => wrong_type(),
                None => RespFrame::Array(Vec::new()),
            },
            "HGET" => match self.kv.lock().get(&arg(1)) {
                Some(Value::Hash(h)) => h
                    .get(&arg(2))
                    .map_or(RespFrame::Null, |v| RespFrame::BulkString(v.clone())),
                Some(_) => wrong_type(),
                None => RespFrame::Null,
            },
            "HGETALL" => match self.kv.lock().get(&arg(1)) {
                Some(Value::Hash(h)) => RespFrame::Array(
                    h.iter()
                        .flat_map(|(f, v)| {
                            [RespFrame::BulkString(f.clone()), RespFrame::BulkString(v.clone())]
                        })
                        .collect(),
                ),
                Some(_) => wrong_type(),
                None => RespFrame::Array(Vec::new()),
            },
            "PUBLISH" => {
                let channel = arg(1);
                let payload = arg(2);
                let subs = self.subscribers.lock();
                let mut receivers = 0;
                for sub in subs.values() {
                    if sub.channels.contains(&channel) {
                        receivers += 1;
                        let _ = sub.tx.send(RespFrame::Array(vec![
                            bulk("message"),
                            RespFrame::BulkString(channel.clone()),
                            RespFrame::BulkString(payload.clone()),
                        ]));
                    }
                    for pattern in &sub.patterns {
                        if glob_match(pattern, &channel) {
                            receivers += 1;
                            let _ = sub.tx.send(RespFrame::Array(vec![
                                bulk("pmessage"),
                                RespFrame::BulkString(pattern.clone()),
                                RespFrame::BulkString(channel.clone()),
                                RespFrame::BulkString(payload.clone()),
                            ]));
                        }
                    }
                }
                RespFrame::Integer(receivers)
            }
            "SCAN" => {
                let cursor: usize = text(&arg(1)).parse().unwrap_or(0);
                let (pattern, count) = scan_options(&args[2..]);
                let mut keys: Vec<Bytes> = self.kv.lock().keys().cloned().collect();
                keys.sort();
                scan_page(keys, cursor, pattern.as_ref(), count)
            }
            "HSCAN" => {
                let cursor: usize = text(&arg(2)).parse().unwrap_or(0);
                let (pattern, count) = scan_options(&args[3..]);
                let fields: Vec<(Bytes, Bytes)> = match self.kv.lock().get(&arg(1)) {
                    Some(Value::Hash(h)) => h.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                    _ => Vec::new(),
                };
                let end = (cursor + count).min(fields.len());
                let page = fields[cursor.min(end)..end]
                    .iter()
                    .filter(|(f, _)| pattern.as_ref().is_none_or(|p| glob_match(p, f)))
                    .flat_map(|(f, v)| {
                        [RespFrame::BulkString(f.clone()), RespFrame::BulkString(v.clone())]
                    })
                    .collect();
                let next = if end >= fields.len() { 0 } else { end };
                RespFrame::Array(vec![bulk(&next.to_string()), RespFrame::Array(page)])
            }
            "CLUSTER" => match (&self.cluster, text(&arg(1)).to_ascii_uppercase().as_str()) {
                (Some(layout), "SLOTS") => layout.slots_reply(),
                (None, _) => RespFrame::error("ERR This instance has cluster support disabled"),
                _ => RespFrame::error("ERR unknown CLUSTER subcommand"),
            },
            _ => return UnknownOr::Unknown,
        };
        UnknownOr::Reply(reply)
    }
}

enum UnknownOr {
    Reply(RespFrame),
    Unknown,
}
