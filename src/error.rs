//! Error types for monitoring operations
//!
//! Every error carries the operation that failed plus the instance (and
//! optionally the node) it was talking to, so log lines stay attributable
//! when dozens of instances poll concurrently.

use std::fmt;

/// Result type alias for monitoring operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Broad classification of a monitoring failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Could not reach the remote endpoint at all
    Connection,

    /// The endpoint answered with an API-level error
    Api,

    /// The endpoint rejected our credentials
    Authentication,

    /// Input failed validation before any request was made
    Validation,

    /// A bug or unexpected condition inside the monitor
    Internal,

    /// The operation ran out of time
    Timeout,
}

/// An error from a monitoring operation, with context
#[derive(Debug)]
pub struct MonitorError {
    kind: ErrorKind,
    op: &'static str,
    instance: String,
    node: Option<String>,
    status: Option<u16>,
    message: String,
}

impl MonitorError {
    pub fn new(
        kind: ErrorKind,
        op: &'static str,
        instance: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            op,
            instance: instance.into(),
            node: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn connection(
        op: &'static str,
        instance: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Connection, op, instance, message)
    }

    pub fn api(
        op: &'static str,
        instance: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let kind = match status {
            401 | 403 | 595 => ErrorKind::Authentication,
            _ => ErrorKind::Api,
        };
        Self {
            status: Some(status),
            ..Self::new(kind, op, instance, message)
        }
    }

    pub fn validation(
        op: &'static str,
        instance: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Validation, op, instance, message)
    }

    pub fn internal(
        op: &'static str,
        instance: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Internal, op, instance, message)
    }

    pub fn timeout(op: &'static str, instance: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, op, instance, "operation timed out")
    }

    /// Attach the node the failing call was targeting
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn op(&self) -> &str {
        self.op
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// True when the upstream rejected our credentials.
    ///
    /// Status 595 is Proxmox's "no ticket" error and counts as auth here;
    /// the cluster failover layer additionally treats it as node-specific.
    pub fn is_auth(&self) -> bool {
        self.kind == ErrorKind::Authentication
    }

    /// True when the failure concerns a cluster member the endpoint was
    /// proxying to, not the endpoint itself. Marking the endpoint unhealthy
    /// for these cascades into false-unhealthy across large clusters.
    pub fn is_node_specific(&self) -> bool {
        match self.status {
            Some(595) => true,
            Some(500) => {
                self.message.contains("hostname lookup")
                    || self.message.contains("Name or service not known")
            }
            _ => false,
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Connection => "connection error",
            ErrorKind::Api => "API error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::Validation => "validation error",
            ErrorKind::Internal => "internal error",
            ErrorKind::Timeout => "timeout",
        };
        write!(f, "{kind} in {} for instance {}", self.op, self.instance)?;
        if let Some(node) = &self.node {
            write!(f, " (node {node})")?;
        }
        if let Some(status) = self.status {
            write!(f, " [status {status}]")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for MonitorError {}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Connection
        } else {
            ErrorKind::Api
        };
        Self::new(kind, "http_request", "", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_classify_as_authentication() {
        for status in [401, 403, 595] {
            let err = MonitorError::api("get_nodes", "pve1", status, "denied");
            assert!(err.is_auth(), "status {status} should be auth");
        }
        let err = MonitorError::api("get_nodes", "pve1", 500, "boom");
        assert!(!err.is_auth());
    }

    #[test]
    fn node_specific_covers_595_and_hostname_lookup() {
        let err = MonitorError::api("get_vms", "lab", 595, "no ticket for hostname lookup");
        assert!(err.is_node_specific());

        let err = MonitorError::api("get_vms", "lab", 500, "hostname lookup 'px9' failed");
        assert!(err.is_node_specific());

        let err = MonitorError::api("get_vms", "lab", 500, "Name or service not known");
        assert!(err.is_node_specific());

        let err = MonitorError::api("get_vms", "lab", 500, "internal error");
        assert!(!err.is_node_specific());
    }

    #[test]
    fn display_includes_context() {
        let err = MonitorError::api("get_storage", "lab", 500, "boom").with_node("px2");
        let text = err.to_string();
        assert!(text.contains("get_storage"));
        assert!(text.contains("lab"));
        assert!(text.contains("px2"));
        assert!(text.contains("500"));
    }
}
