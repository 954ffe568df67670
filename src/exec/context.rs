//! Shared state threaded through every operator task of one query.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PlasmaError;
use crate::graph::GraphStore;
use crate::model::PropValue;
use crate::net::{Connector, StreamFrame};
use crate::plan::Plan;
use crate::tuple::PathTuple;

/// Error event riding the result stream next to the records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Machine-readable code, mirroring [`PlasmaError::code`].
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl From<&PlasmaError> for ErrorEvent {
    fn from(err: &PlasmaError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}

/// A remote tuple stream handed from a traverse operator to the receive
/// operator: frames off the wire plus the local tuple each remote tuple
/// is merged into.
pub(crate) struct RemoteStream {
    /// Frames arriving from the remote peer.
    pub frames: mpsc::Receiver<StreamFrame>,
    /// The tuple that hit the proxy; remote tuples extend it.
    pub base: PathTuple,
}

/// Registry of named outbound channels used by send operators. Owned by
/// the runtime so sub-query handlers can register a destination before
/// executing the shipped plan.
pub type OutputRegistry = Arc<Mutex<HashMap<String, mpsc::Sender<PathTuple>>>>;

/// Per-query context cloned into every operator task. Holds no channel
/// receivers; senders live with the tasks that write to them so closure
/// propagates by drop.
#[derive(Clone)]
pub(crate) struct RuntimeContext {
    /// The peer's graph, read-only.
    pub graph: Arc<dyn GraphStore>,
    /// Connection manager, plumbed explicitly rather than kept global.
    pub connector: Arc<Connector>,
    /// The executing plan.
    pub plan: Arc<Plan>,
    /// Merged seed values: plan seeds overridden by call parameters.
    pub values: Arc<BTreeMap<String, PropValue>>,
    /// Error events destined for the result stream.
    pub errors: mpsc::UnboundedSender<ErrorEvent>,
    /// Named outbound channels for send operators.
    pub outputs: OutputRegistry,
}

impl RuntimeContext {
    /// Reports a non-fatal error: the offending tuple is gone, the query
    /// continues.
    pub fn report(&self, err: &PlasmaError) {
        tracing::debug!(code = err.code(), %err, "query error event");
        let _ = self.errors.send(ErrorEvent::from(err));
    }

    /// Forwards an error event received from a remote peer.
    pub fn report_event(&self, event: ErrorEvent) {
        tracing::debug!(code = %event.code, message = %event.message, "remote error event");
        let _ = self.errors.send(event);
    }

    /// Claims the outbound channel a send operator forwards onto. The
    /// operator takes sole ownership so the channel closes with it.
    pub fn take_output(&self, name: &str) -> Option<mpsc::Sender<PathTuple>> {
        self.outputs.lock().remove(name)
    }
}
