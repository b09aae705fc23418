use scanfleet_node::api::NodeApiError;

/// Errors surfaced by the dispatcher to its host.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Connection-level failure talking to a node. Retried once.
    #[error("Unable to reach scan node ({node}): {reason}")]
    NodeUnreachable { node: String, reason: String },

    /// A request to a node, or a whole scan, ran out of time. Retried once.
    #[error("Scan node ({node}) timeout: {reason}")]
    NodeTimeout { node: String, reason: String },

    /// Every node has been tried and none has an active engine.
    #[error("No scan node has an active engine after {attempts} attempts")]
    NodeCapabilityExhausted { attempts: usize },

    /// The node answered, but not in the shape the protocol promises.
    #[error("Malformed response from scan node ({node}): {detail}")]
    MalformedResponse { node: String, detail: String },

    /// The node refused a request with a non-200 status.
    #[error("Scan node ({node}) answered HTTP {status}: {message}")]
    NodeRejected {
        node: String,
        status: u16,
        message: String,
    },

    /// Invalid node list or settings.
    #[error("Invalid configuration: {0}")]
    StartupConfiguration(String),

    /// No configured node reported a single active engine at startup.
    #[error("Unable to reach any scan node to build the engine map")]
    NoUsableNode,
}

impl DispatchError {
    /// Whether the dispatch boundary should retry the scan once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeUnreachable { .. } | Self::NodeTimeout { .. })
    }

    /// Attribute a node client error to the node it came from.
    pub fn from_node(node: &str, err: NodeApiError) -> Self {
        let node = node.to_string();
        match err {
            NodeApiError::Timeout(reason) => Self::NodeTimeout { node, reason },
            NodeApiError::Unreachable(reason) => Self::NodeUnreachable { node, reason },
            NodeApiError::ApiError { status, message } => Self::NodeRejected {
                node,
                status,
                message,
            },
            NodeApiError::Decode(e) => Self::MalformedResponse {
                node,
                detail: e.to_string(),
            },
            NodeApiError::Client(reason) => Self::StartupConfiguration(reason),
        }
    }
}
