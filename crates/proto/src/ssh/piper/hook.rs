//! Packet hooks run by the shuttle.
//!
//! Each direction of a pipe has an ordered [`HookChain`]. Hooks receive the
//! decrypted payload of every packet (`packet[0]` is the message number) and
//! own it for the duration of the call. A hook ignores what it does not
//! recognise by handing the packet back unchanged.

use crate::ssh::message::MessageType;
use crate::ssh::wire::read_utf8;
use piper_platform::PiperResult;
use std::sync::Arc;
use tracing::trace;

/// Result of one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Forward this (possibly rewritten) packet and run the next hook.
    Transform(Vec<u8>),
    /// Send this packet back to the source and drop the original.
    Reply(Vec<u8>),
    /// Forward nothing.
    Drop,
}

/// A packet hook. Errors end the pipe.
pub trait PacketHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one packet.
    fn handle(&self, packet: Vec<u8>) -> PiperResult<HookAction>;
}

/// Ordered hooks for one direction.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn PacketHook>>,
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

impl HookChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook.
    pub fn push(&mut self, hook: Arc<dyn PacketHook>) {
        self.hooks.push(hook);
    }

    /// Appends a hook, builder style.
    pub fn with(mut self, hook: Arc<dyn PacketHook>) -> Self {
        self.push(hook);
        self
    }

    /// Whether the chain has no hooks.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the chain. Stops at the first `Reply` or `Drop`; otherwise the
    /// result is the last transformed packet.
    pub fn run(&self, packet: Vec<u8>) -> PiperResult<HookAction> {
        let mut current = packet;
        for hook in &self.hooks {
            match hook.handle(current)? {
                HookAction::Transform(next) => current = next,
                stop => {
                    trace!(hook = hook.name(), action = action_name(&stop), "hook chain stopped");
                    return Ok(stop);
                }
            }
        }
        Ok(HookAction::Transform(current))
    }
}

fn action_name(action: &HookAction) -> &'static str {
    match action {
        HookAction::Transform(_) => "transform",
        HookAction::Reply(_) => "reply",
        HookAction::Drop => "drop",
    }
}

/// Drops the upstream's `hostkeys-00@openssh.com` announcements; the
/// downstream client only knows the proxy's host keys.
#[derive(Debug, Default)]
pub struct DropHostkeysMessage;

const HOSTKEYS_REQUESTS: [&str; 2] = ["hostkeys-00@openssh.com", "hostkeys-prove-00@openssh.com"];

impl PacketHook for DropHostkeysMessage {
    fn name(&self) -> &str {
        "drop-hostkeys-message"
    }

    fn handle(&self, packet: Vec<u8>) -> PiperResult<HookAction> {
        if packet.first() != Some(&(MessageType::GlobalRequest as u8)) {
            return Ok(HookAction::Transform(packet));
        }
        let mut offset = 1;
        match read_utf8(&packet, &mut offset) {
            Ok(name) if HOSTKEYS_REQUESTS.contains(&name.as_str()) => Ok(HookAction::Drop),
            _ => Ok(HookAction::Transform(packet)),
        }
    }
}

/// Answers SSH_MSG_PING with SSH_MSG_PONG carrying the same data.
#[derive(Debug, Default)]
pub struct ReplyPing;

impl PacketHook for ReplyPing {
    fn name(&self) -> &str {
        "reply-ping"
    }

    fn handle(&self, mut packet: Vec<u8>) -> PiperResult<HookAction> {
        if packet.first() == Some(&(MessageType::Ping as u8)) {
            packet[0] = MessageType::Pong as u8;
            return Ok(HookAction::Reply(packet));
        }
        Ok(HookAction::Transform(packet))
    }
}
