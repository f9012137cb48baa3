//! Destination-pattern event dispatch.
//!
//! Handlers register for an [`EventKind`] and a destination pattern. When
//! the relay handles a frame of that kind, every matching handler runs in
//! registration order with an explicit [`EventContext`].
//!
//! Patterns are `/`-separated like destinations: `*` matches one segment,
//! `**` matches any number of segments (including none), and `{name}`
//! matches one segment and captures it as a path parameter.
//!
//! ```
//! use stomp_relay::events::{capture, matches};
//!
//! assert!(matches("/topic/*", "/topic/prices"));
//! assert!(matches("/topic/**", "/topic/a/b"));
//! assert!(!matches("/topic/*", "/topic/a/b"));
//!
//! let params = capture("/queue/{user}/inbox", "/queue/alice/inbox").unwrap();
//! assert_eq!(params["user"], "alice");
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

use crate::command::Command;
use crate::frame::Frame;

/// Frames the relay reports after handling them successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl EventKind {
    pub fn for_command(command: Command) -> Option<Self> {
        match command {
            Command::Connect | Command::Stomp => Some(EventKind::Connect),
            Command::Send => Some(EventKind::Send),
            Command::Subscribe => Some(EventKind::Subscribe),
            Command::Unsubscribe => Some(EventKind::Unsubscribe),
            Command::Disconnect => Some(EventKind::Disconnect),
            _ => None,
        }
    }
}

/// Everything a handler gets to see about the triggering frame.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub kind: EventKind,
    pub session_id: String,
    pub frame: Frame,
    /// Parameters captured by `{name}` segments of the matched pattern.
    pub params: HashMap<String, String>,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext);
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&EventContext) + Send + Sync,
{
    async fn handle(&self, ctx: &EventContext) {
        self(ctx)
    }
}

struct Registration {
    kind: EventKind,
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

/// Ordered registry of `(kind, pattern, handler)` entries.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for frames of `kind` whose destination matches
    /// `pattern`. Frames without a destination (CONNECT, DISCONNECT,
    /// UNSUBSCRIBE) reach every handler of their kind.
    pub fn on(&self, kind: EventKind, pattern: impl Into<String>, handler: impl EventHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                kind,
                pattern: pattern.into(),
                handler: Arc::new(handler),
            });
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handlers registered for `frame`. Returns how many ran.
    pub async fn fire(&self, session_id: &str, frame: &Frame) -> usize {
        let Some(kind) = frame.command().and_then(EventKind::for_command) else {
            return 0;
        };

        // Snapshot so no lock is held across handler awaits.
        let selected: Vec<(Arc<dyn EventHandler>, HashMap<String, String>)> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers
                .iter()
                .filter(|r| r.kind == kind)
                .filter_map(|r| {
                    let params = match frame.destination() {
                        Some(dest) => capture(&r.pattern, dest)?,
                        None => HashMap::new(),
                    };
                    Some((r.handler.clone(), params))
                })
                .collect()
        };

        let count = selected.len();
        for (handler, params) in selected {
            let ctx = EventContext {
                kind,
                session_id: session_id.to_string(),
                frame: frame.clone(),
                params,
            };
            handler.handle(&ctx).await;
        }
        trace!(session = %session_id, ?kind, handlers = count, "event fired");
        count
    }
}

/// Does `destination` match `pattern`?
pub fn matches(pattern: &str, destination: &str) -> bool {
    capture(pattern, destination).is_some()
}

/// Match `destination` against `pattern`, returning the captured
/// parameters on success.
pub fn capture(pattern: &str, destination: &str) -> Option<HashMap<String, String>> {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let destination: Vec<&str> = destination.split('/').collect();
    let mut params = HashMap::new();
    match_segments(&pattern, &destination, &mut params).then_some(params)
}

fn match_segments(pattern: &[&str], dest: &[&str], params: &mut HashMap<String, String>) -> bool {
    let Some((&segment, rest)) = pattern.split_first() else {
        return dest.is_empty();
    };

    if segment == "**" {
        for skip in 0..=dest.len() {
            let mut attempt = params.clone();
            if match_segments(rest, &dest[skip..], &mut attempt) {
                *params = attempt;
                return true;
            }
        }
        return false;
    }

    let Some((&value, dest_rest)) = dest.split_first() else {
        return false;
    };
    if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        params.insert(name.to_string(), value.to_string());
    } else if segment != "*" && segment != value {
        return false;
    }
    match_segments(rest, dest_rest, params)
}
