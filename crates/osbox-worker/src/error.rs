use tonic::Status;

/// Domain-level errors surfaced across the worker boundary.
///
/// Transport errors are mapped into these kinds exactly once at each
/// boundary; lower-level causes are preserved through `source` chains and
/// never leak into the wire error kind.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("boot timeout for sandbox {0}")]
    BootTimeout(String),

    #[error("vm exited unexpectedly: sandbox {0}")]
    VmExited(String),

    #[error("firecracker API error: {0}")]
    VmmApiError(String),

    #[error("guest agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("guest agent timed out: {0}")]
    AgentTimeout(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {context}")]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("no snapshot for sandbox {0}")]
    SnapshotMissing(String),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("sandbox already exists: {0}")]
    SandboxExists(String),

    #[error("sandbox {id} is not running (status: {status})")]
    SandboxNotRunning { id: String, status: String },

    #[error("sandbox already hibernated: {0}")]
    SandboxAlreadyHibernated(String),

    #[error("egress denied to {0}")]
    EgressDenied(String),

    #[error("proxy TLS error: {0}")]
    ProxyTlsError(String),
}

impl WorkerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            context: context.into(),
            source,
        }
    }

    /// Map a guest agent transport error to a domain kind. Applied once, at
    /// the router boundary.
    pub fn from_agent_status(status: Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Self::FileNotFound(status.message().to_string()),
            tonic::Code::PermissionDenied => {
                Self::PermissionDenied(status.message().to_string())
            }
            tonic::Code::DeadlineExceeded => Self::AgentTimeout(status.message().to_string()),
            tonic::Code::InvalidArgument | tonic::Code::Internal => Self::IoError {
                context: status.message().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "agent file op"),
            },
            tonic::Code::Unavailable | tonic::Code::Cancelled => {
                Self::AgentUnavailable(status.message().to_string())
            }
            _ => Self::AgentUnavailable(format!(
                "agent RPC failed: {}: {}",
                status.code(),
                status.message()
            )),
        }
    }
}

impl From<WorkerError> for Status {
    fn from(err: WorkerError) -> Self {
        use WorkerError::*;
        let msg = err.to_string();
        match err {
            TemplateNotFound(_) | SandboxNotFound(_) | FileNotFound(_) | SnapshotMissing(_) => {
                Status::not_found(msg)
            }
            ResourceExhausted(_) => Status::resource_exhausted(msg),
            SandboxExists(_) => Status::already_exists(msg),
            BootTimeout(_) | AgentTimeout(_) => Status::deadline_exceeded(msg),
            AgentUnavailable(_) | VmExited(_) => Status::unavailable(msg),
            SandboxNotRunning { .. } | SandboxAlreadyHibernated(_) => {
                Status::failed_precondition(msg)
            }
            PermissionDenied(_) | EgressDenied(_) => Status::permission_denied(msg),
            _ => Status::internal(msg),
        }
    }
}
