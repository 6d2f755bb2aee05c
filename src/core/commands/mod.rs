// src/core/commands/mod.rs

//! The command model: a `Command` is an ordered list of binary-safe arguments
//! plus the static descriptor that tells the dispatcher how to route it and
//! how to transform its reply.

pub mod command_spec;
pub mod key_extractor;
pub mod transform;

pub use command_spec::{CommandFlags, CommandSpec, KeySpec, lookup};
pub use transform::ReplyTransform;

use bytes::{Bytes, BytesMut};

/// A value that can be used as a command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Bytes {
                let mut buf = itoa::Buffer::new();
                Bytes::copy_from_slice(buf.format(*self).as_bytes())
            }
        })*
    };
}

int_to_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        if self.is_infinite() {
            return Bytes::from_static(if *self > 0.0 { b"+inf" } else { b"-inf" });
        }
        let mut buf = ryu::Buffer::new();
        let s = buf.format(*self);
        // ryu renders integral floats as "1.0"; the server accepts both forms.
        Bytes::copy_from_slice(s.as_bytes())
    }
}

impl ToArg for f32 {
    fn to_arg(&self) -> Bytes {
        f64::from(*self).to_arg()
    }
}

/// A single command ready to be queued on a connection.
///
/// `parts()[0]` is the command name exactly as it is written to the wire.
#[derive(Debug, Clone)]
pub struct Command {
    parts: Vec<Bytes>,
    name: String,
    spec: Option<&'static CommandSpec>,
    transform: ReplyTransform,
}

/// Starts building a command, e.g. `cmd("SET").arg("key").arg(1)`.
pub fn cmd(name: &str) -> Command {
    Command::new(name)
}

impl Command {
    /// Creates a command, resolving its descriptor from the static table.
    pub fn new(name: &str) -> Self {
        let spec = lookup(name);
        Self {
            parts: vec![Bytes::copy_from_slice(name.as_bytes())],
            name: name.to_ascii_uppercase(),
            spec,
            transform: spec.map(|s| s.transform).unwrap_or_default(),
        }
    }

    /// Builds a command from a complete argument vector (name first).
    pub fn from_parts(parts: Vec<Bytes>) -> Option<Self> {
        let name = std::str::from_utf8(parts.first()?).ok()?.to_string();
        let mut command = Self::new(&name);
        command.parts = parts;
        Some(command)
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.parts.push(arg.to_arg());
        self
    }

    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.parts.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// Overrides the reply transform chosen by the descriptor table.
    pub fn with_transform(mut self, transform: ReplyTransform) -> Self {
        self.transform = transform;
        self
    }

    /// The uppercased command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full argument vector, name included.
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn spec(&self) -> Option<&'static CommandSpec> {
        self.spec
    }

    /// Whether the argument count fits the command's arity. Commands missing
    /// from the table are always accepted.
    pub fn has_valid_arity(&self) -> bool {
        self.spec.is_none_or(|spec| spec.accepts_arity(self.parts.len()))
    }

    pub fn transform(&self) -> ReplyTransform {
        self.transform
    }

    pub fn flags(&self) -> CommandFlags {
        self.spec.map(|s| s.flags).unwrap_or_else(CommandFlags::empty)
    }

    /// Keys used for slot routing, in argument order.
    pub fn keys(&self) -> Vec<&Bytes> {
        match self.spec {
            Some(spec) => key_extractor::key_positions(&spec.keys, &self.parts)
                .into_iter()
                .map(|i| &self.parts[i])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Prepends `prefix` to every key argument.
    pub fn with_key_prefix(mut self, prefix: &[u8]) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let Some(spec) = self.spec else {
            return self;
        };
        for i in key_extractor::key_positions(&spec.keys, &self.parts) {
            let mut prefixed = BytesMut::with_capacity(prefix.len() + self.parts[i].len());
            prefixed.extend_from_slice(prefix);
            prefixed.extend_from_slice(&self.parts[i]);
            self.parts[i] = prefixed.freeze();
        }
        self
    }

    /// Whether the server may hold the reply back indefinitely.
    ///
    /// `XREAD`/`XREADGROUP` only block when a `BLOCK` option is present.
    pub fn is_blocking(&self) -> bool {
        if self.flags().contains(CommandFlags::BLOCKING) {
            return true;
        }
        matches!(self.name.as_str(), "XREAD" | "XREADGROUP")
            && self
                .parts
                .iter()
                .skip(1)
                .any(|a| a.eq_ignore_ascii_case(b"BLOCK"))
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(CommandFlags::READONLY)
    }

    /// Whether the command may be issued while the connection is in subscriber mode.
    pub fn allowed_in_subscriber_mode(&self) -> bool {
        self.flags().contains(CommandFlags::SUBSCRIBER)
    }

    /// The subscription operation this command performs, if any.
    pub fn subscription_op(&self) -> Option<SubscriptionOp> {
        match self.name.as_str() {
            "SUBSCRIBE" => Some(SubscriptionOp::Subscribe),
            "PSUBSCRIBE" => Some(SubscriptionOp::PSubscribe),
            "UNSUBSCRIBE" => Some(SubscriptionOp::Unsubscribe),
            "PUNSUBSCRIBE" => Some(SubscriptionOp::PUnsubscribe),
            _ => None,
        }
    }

    /// The channel or pattern arguments of a subscription command.
    pub fn subscription_targets(&self) -> &[Bytes] {
        &self.parts[1..]
    }
}

/// The four commands that mutate a connection's subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    PSubscribe,
    Unsubscribe,
    PUnsubscribe,
}

impl SubscriptionOp {
    /// The first element of the acknowledgement array the server sends back.
    pub fn ack_kind(self) -> &'static [u8] {
        match self {
            SubscriptionOp::Subscribe => b"subscribe",
            SubscriptionOp::PSubscribe => b"psubscribe",
            SubscriptionOp::Unsubscribe => b"unsubscribe",
            SubscriptionOp::PUnsubscribe => b"punsubscribe",
        }
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, SubscriptionOp::PSubscribe | SubscriptionOp::PUnsubscribe)
    }
}
