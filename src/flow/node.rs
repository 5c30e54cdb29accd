use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::flow::config::RawNode;
use crate::flow::flow::FlowCore;
use crate::hooks::{HookAction, HookPayload, SendEvent};
use crate::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("processing failed: {0}")]
    ExecutionFailed(String),
    #[error("delivery aborted by hook `{0}`")]
    HookFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Binds an implementation to a node instance: decode the raw record,
/// register input/close handlers, set up whatever the node needs.
pub type NodeConstructor =
    Arc<dyn Fn(Arc<NodeInstance>, &RawNode) -> Result<(), NodeError> + Send + Sync>;

pub type InputHandler =
    Arc<dyn Fn(Message, Arc<NodeInstance>) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

pub type CloseHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

/// How wired sends reach their destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Enqueue on the destination's input queue; `send` returns once the
    /// message is handed off. Bounds stack depth on long or cyclic chains.
    #[default]
    Queued,
    /// Await the destination handler inline. Lower latency; unbounded
    /// recursion on cycles.
    Direct,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn text(text: impl Into<String>) -> Self {
        Self { fill: None, shape: None, text: Some(text.into()) }
    }
}

/// A live node created from a type constructor bound to one config record.
///
/// Messages arrive on a FIFO input queue pumped by a dedicated task, so a
/// node is never invoked with a new message while still processing the
/// previous one.
pub struct NodeInstance {
    id: String,
    node_type: String,
    name: Option<String>,
    flow: Arc<FlowCore>,
    wires: Vec<Vec<String>>,
    status: Mutex<NodeStatus>,
    input: Mutex<Option<InputHandler>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    queue: mpsc::UnboundedSender<Message>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    context: Context,
    cancel: CancellationToken,
}

impl fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInstance")
            .field("id", &self.id)
            .field("type", &self.node_type)
            .field("flow", &self.flow.flow_id())
            .finish()
    }
}

impl NodeInstance {
    pub(crate) fn with_wires(
        record: &RawNode,
        wires: Vec<Vec<String>>,
        flow: Arc<FlowCore>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Context::new(flow.flow_context(), flow.global_context());
        Arc::new(Self {
            id: record.id.clone(),
            node_type: record.node_type.clone(),
            name: record.name.clone(),
            flow,
            wires,
            status: Mutex::new(NodeStatus::default()),
            input: Mutex::new(None),
            close_handlers: Mutex::new(Vec::new()),
            queue: tx,
            queue_rx: Mutex::new(Some(rx)),
            context,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn flow_id(&self) -> String {
        self.flow.flow_id().to_string()
    }

    pub fn wires(&self) -> &[Vec<String>] {
        &self.wires
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Register the input handler. At most one; later calls replace it.
    pub fn on_input(&self, handler: InputHandler) {
        *self.input.lock().unwrap() = Some(handler);
    }

    /// Register a close handler; handlers run in registration order at stop.
    pub fn on_close(&self, handler: CloseHandler) {
        self.close_handlers.lock().unwrap().push(handler);
    }

    pub fn status(&self) -> NodeStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn update_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap() = status.clone();
        self.flow.report_status(&self.id, &status);
    }

    pub fn log(&self, text: &str) {
        tracing::info!(node = %self.id, r#type = %self.node_type, "{text}");
    }

    pub fn warn(&self, text: &str) {
        tracing::warn!(node = %self.id, r#type = %self.node_type, "{text}");
    }

    /// Report a runtime error, routing it to catch nodes in the same flow.
    pub fn error(&self, error: &NodeError, msg: Option<&Message>) {
        self.flow.handle_node_error(&self.id, &self.node_type, error, msg);
    }

    /// Hand a message to this node from outside the wire pipeline.
    pub fn receive(&self, msg: Message) {
        self.enqueue(msg);
    }

    fn enqueue(&self, msg: Message) {
        if self.queue.send(msg).is_err() {
            debug!(node = %self.id, "message dropped, input queue closed");
        }
    }

    /// Send one message out of output port 0.
    pub async fn send(self: &Arc<Self>, msg: Message) {
        self.send_ports(vec![vec![msg]]).await;
    }

    /// Send messages out of multiple ports; index selects the port.
    ///
    /// Per port, the first wired destination receives the original message
    /// and every further destination an independent clone.
    pub async fn send_ports(self: &Arc<Self>, ports: Vec<Vec<Message>>) {
        let hooks = self.flow.hooks();

        // batch construction: the clone decision is made here, before any
        // hook sees the events
        let mut batch: Vec<SendEvent> = Vec::new();
        for (port_ix, msgs) in ports.into_iter().enumerate() {
            let Some(dests) = self.wires.get(port_ix) else {
                continue;
            };
            if dests.is_empty() {
                continue;
            }
            for msg in msgs {
                let clones: Vec<Message> =
                    (1..dests.len()).map(|_| msg.duplicate()).collect();
                let mut messages = Vec::with_capacity(dests.len());
                messages.push(msg); // the original goes to the first wire
                messages.extend(clones);
                for ((dest_ix, dest), event_msg) in dests.iter().enumerate().zip(messages) {
                    batch.push(SendEvent {
                        msg: event_msg,
                        source: Some(self.id.clone()),
                        source_port: port_ix,
                        destination: Some(dest.clone()),
                        cloned: dest_ix > 0,
                    });
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        // onSend sees the whole batch before routing decisions
        let mut payload = HookPayload::SendBatch(batch);
        match hooks.trigger("onSend", &mut payload) {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Halt) => return,
            Err(failure) => {
                self.error(&NodeError::HookFailed(failure.hook.clone()), None);
                return;
            }
        }
        let HookPayload::SendBatch(batch) = payload else {
            return;
        };

        for event in batch {
            self.route_one(event).await;
        }
    }

    async fn route_one(&self, event: SendEvent) {
        let hooks = self.flow.hooks();
        let mut payload = HookPayload::Delivery(event);

        for stage in ["preRoute", "preDeliver"] {
            match hooks.trigger(stage, &mut payload) {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::Halt) => return,
                Err(failure) => {
                    self.error(&NodeError::HookFailed(failure.hook.clone()), None);
                    return;
                }
            }
        }

        let HookPayload::Delivery(event) = payload else {
            return;
        };
        let Some(dest_id) = event.destination.clone() else {
            return;
        };
        let Some(dest) = self.flow.node(&dest_id) else {
            warn!(node = %self.id, dest = %dest_id, "wire references unknown node");
            return;
        };

        // hand off, then let postDeliver observe the handed-off event
        let observed = if hooks.is_empty("postDeliver") {
            None
        } else {
            Some(event.msg.duplicate())
        };
        let (source, source_port, cloned) = (event.source, event.source_port, event.cloned);
        match self.flow.delivery_mode() {
            DeliveryMode::Queued => dest.enqueue(event.msg),
            DeliveryMode::Direct => dest.clone().dispatch(event.msg).await,
        }
        if let Some(msg) = observed {
            let mut payload = HookPayload::Delivery(SendEvent {
                msg,
                source,
                source_port,
                destination: Some(dest_id),
                cloned,
            });
            if let Err(failure) = hooks.trigger("postDeliver", &mut payload) {
                self.error(&NodeError::HookFailed(failure.hook.clone()), None);
            }
        }
    }

    /// Run the receive half of the pipeline for one message.
    fn dispatch(self: Arc<Self>, msg: Message) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let hooks = self.flow.hooks();

            let msg = {
                let mut payload = HookPayload::Delivery(SendEvent {
                    msg,
                    source: None,
                    source_port: 0,
                    destination: Some(self.id.clone()),
                    cloned: false,
                });
                match hooks.trigger("onReceive", &mut payload) {
                    Ok(HookAction::Continue) => {}
                    Ok(HookAction::Halt) => {
                        debug!(node = %self.id, "message dropped by onReceive hook");
                        return;
                    }
                    Err(failure) => {
                        self.error(&NodeError::HookFailed(failure.hook.clone()), None);
                        return;
                    }
                }
                let HookPayload::Delivery(event) = payload else {
                    return;
                };
                event.msg
            };

            let Some(handler) = self.input.lock().unwrap().clone() else {
                trace!(node = %self.id, "no input handler, message dropped");
                return;
            };

            let observe = !hooks.is_empty("postReceive") || !hooks.is_empty("onComplete");
            let observed = observe.then(|| msg.duplicate());

            let result = handler(msg, self.clone()).await;
            if let Err(error) = &result {
                self.error(error, observed.as_ref());
            }

            if let Some(observed) = observed {
                let mut payload = HookPayload::Delivery(SendEvent {
                    msg: observed.duplicate(),
                    source: None,
                    source_port: 0,
                    destination: Some(self.id.clone()),
                    cloned: false,
                });
                let _ = hooks.trigger("postReceive", &mut payload);

                let mut payload = HookPayload::Complete(crate::hooks::CompleteEvent {
                    msg: observed,
                    node: self.id.clone(),
                    error: result.err().map(|e| e.to_string()),
                });
                let _ = hooks.trigger("onComplete", &mut payload);
            }
        })
    }

    /// Spawn the input pump. Called once, at flow start.
    pub(crate) fn start_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.queue_rx.lock().unwrap().take() else {
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        // single-flight: the next message is not picked up
                        // until this one's handler returns
                        Some(msg) => node.clone().dispatch(msg).await,
                        None => break,
                    },
                }
            }
        });
    }

    /// Run the close protocol: each handler in sequence, each with its own
    /// timeout. A handler that never completes is abandoned, not retried.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let handlers: Vec<CloseHandler> = {
            let guard = self.close_handlers.lock().unwrap();
            guard.clone()
        };
        for handler in handlers {
            match timeout(self.flow.close_timeout(), handler()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(node = %self.id, %error, "close handler failed");
                }
                Err(_) => {
                    warn!(
                        node = %self.id,
                        timeout = ?self.flow.close_timeout(),
                        "close handler did not finish in time, abandoned"
                    );
                }
            }
        }
    }
}
