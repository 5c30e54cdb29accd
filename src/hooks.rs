use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

use crate::message::Message;

/// Every hook name the runtime will accept registrations for.
///
/// The message pipeline invokes the first seven in order around each send;
/// the install pipeline invokes the module lifecycle points.
pub static KNOWN_HOOKS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "onSend",
        "preRoute",
        "preDeliver",
        "postDeliver",
        "onReceive",
        "postReceive",
        "onComplete",
        "preInstall",
        "postInstall",
        "preUninstall",
        "postUninstall",
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Deliberate drop of the event. Not an error.
    Halt,
}

/// A hook callback threw; delivery of the affected message is aborted.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("hook `{hook}` failed: {reason}")]
pub struct HookFailure {
    pub hook: String,
    pub label: Option<String>,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum HookError {
    #[error("unknown hook `{0}`")]
    UnknownHook(String),
    #[error("hook `{name}` already has a handler labelled `{label}`")]
    DuplicateLabel { name: String, label: String },
    #[error("invalid hook specification `{0}`")]
    InvalidSpec(String),
}

/// One message heading to one destination (or, during `onSend`, one entry of
/// the batch before routing decisions are made).
#[derive(Debug)]
pub struct SendEvent {
    pub msg: Message,
    pub source: Option<String>,
    pub source_port: usize,
    pub destination: Option<String>,
    /// Whether `msg` is a clone rather than the original message object.
    pub cloned: bool,
}

#[derive(Debug)]
pub struct CompleteEvent {
    pub msg: Message,
    pub node: String,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ModuleEvent {
    pub module: String,
    pub version: Option<String>,
}

/// The mutable event handed through a hook chain.
#[derive(Debug)]
pub enum HookPayload {
    /// `onSend` sees the whole batch before any routing decision.
    SendBatch(Vec<SendEvent>),
    /// Per-destination stages (`preRoute` .. `postReceive`).
    Delivery(SendEvent),
    Complete(CompleteEvent),
    Module(ModuleEvent),
}

pub type HookCallback = Arc<dyn Fn(&mut HookPayload) -> Result<HookAction, String> + Send + Sync>;

struct HookEntry {
    label: Option<String>,
    removed: AtomicBool,
    callback: HookCallback,
}

/// Ordered, label-addressable interception chains, one per hook name.
///
/// Removal soft-deletes: a trigger walking a chain snapshot still sees the
/// entry but skips it, so chains are never mutated under a traversal.
/// Registrations persist across deploys until their owner removes them.
pub struct HookManager {
    chains: Mutex<HashMap<String, Vec<Arc<HookEntry>>>>,
}

impl HookManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { chains: Mutex::new(HashMap::new()) })
    }

    /// Append a handler to the tail of a hook chain.
    ///
    /// `spec` is `name` or `name.label`; a `(name, label)` pair must be
    /// unique while registered.
    pub fn add(&self, spec: &str, callback: HookCallback) -> Result<(), HookError> {
        let (name, label) = split_spec(spec)?;
        if !KNOWN_HOOKS.contains(&name) {
            return Err(HookError::UnknownHook(name.to_string()));
        }
        let mut chains = self.chains.lock().unwrap();
        let chain = chains.entry(name.to_string()).or_default();
        if let Some(label) = label {
            let duplicate = chain
                .iter()
                .any(|e| !e.removed.load(Ordering::Acquire) && e.label.as_deref() == Some(label));
            if duplicate {
                return Err(HookError::DuplicateLabel {
                    name: name.to_string(),
                    label: label.to_string(),
                });
            }
        }
        chain.push(Arc::new(HookEntry {
            label: label.map(str::to_string),
            removed: AtomicBool::new(false),
            callback,
        }));
        Ok(())
    }

    /// Remove handlers by label: `name.label` removes from one chain,
    /// `*.label` removes that label from every chain (bulk teardown when a
    /// plugin unloads). Returns how many handlers were removed.
    pub fn remove(&self, spec: &str) -> Result<usize, HookError> {
        let (name, label) = split_spec(spec)?;
        let Some(label) = label else {
            // unlabelled handlers cannot be addressed for removal
            return Err(HookError::InvalidSpec(spec.to_string()));
        };
        let mut chains = self.chains.lock().unwrap();
        let mut removed = 0;
        for (chain_name, chain) in chains.iter_mut() {
            if name != "*" && chain_name != name {
                continue;
            }
            for entry in chain.iter() {
                if entry.label.as_deref() == Some(label)
                    && !entry.removed.swap(true, Ordering::AcqRel)
                {
                    removed += 1;
                }
            }
            // physical unlink happens here, under the lock; in-flight
            // triggers hold a snapshot and skip via the tombstone flag
            chain.retain(|e| !e.removed.load(Ordering::Acquire));
        }
        Ok(removed)
    }

    /// Walk a chain head-to-tail, stopping at the first halt or failure.
    pub fn trigger(&self, name: &str, payload: &mut HookPayload) -> Result<HookAction, HookFailure> {
        let snapshot: Vec<Arc<HookEntry>> = {
            let chains = self.chains.lock().unwrap();
            match chains.get(name) {
                Some(chain) => chain.clone(),
                None => return Ok(HookAction::Continue),
            }
        };
        for entry in snapshot {
            if entry.removed.load(Ordering::Acquire) {
                continue;
            }
            match (entry.callback)(payload) {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::Halt) => {
                    debug!(hook = name, label = ?entry.label, "hook halted event");
                    return Ok(HookAction::Halt);
                }
                Err(reason) => {
                    return Err(HookFailure {
                        hook: name.to_string(),
                        label: entry.label.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(HookAction::Continue)
    }

    /// Number of live handlers on a chain.
    pub fn len(&self, name: &str) -> usize {
        let chains = self.chains.lock().unwrap();
        chains
            .get(name)
            .map(|c| {
                c.iter()
                    .filter(|e| !e.removed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Drop every registration. Test support.
    pub fn clear(&self) {
        self.chains.lock().unwrap().clear();
    }
}

fn split_spec(spec: &str) -> Result<(&str, Option<&str>), HookError> {
    match spec.split_once('.') {
        None if spec.is_empty() => Err(HookError::InvalidSpec(spec.to_string())),
        None => Ok((spec, None)),
        Some((name, label)) if name.is_empty() || label.is_empty() || label.contains('.') => {
            Err(HookError::InvalidSpec(spec.to_string()))
        }
        Some((name, label)) => Ok((name, Some(label))),
    }
}
