use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    MissingField(String),
    IoError(std::io::Error),
    TomlError(String),
    NotInRange(String),
    BadPortsRange(String),
    DirectoryDoesNotExist(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingField(field) => write!(f, "missing config field: {}", field),
            ConfigError::IoError(err) => write!(f, "config IO error: {}", err),
            ConfigError::TomlError(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::NotInRange(msg) => write!(f, "config value out of range: {}", msg),
            ConfigError::BadPortsRange(msg) => write!(f, "bad port range: {}", msg),
            ConfigError::DirectoryDoesNotExist(path) => {
                write!(f, "directory does not exist: {}", path)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    NotFound(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => write!(f, "storage connection failed: {}", msg),
            StorageError::WriteFailed(msg) => write!(f, "storage write failed: {}", msg),
            StorageError::ReadFailed(msg) => write!(f, "storage read failed: {}", msg),
            StorageError::NotFound(what) => write!(f, "not found: {}", what),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        StorageError::WriteFailed(err.to_string())
    }
}

#[derive(Debug)]
pub enum ProxyError {
    NoOpenPort,
    Bind(std::io::Error),
    Tls(String),
    DisallowedAddress(String),
    BadGateway(String),
    Io(std::io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoOpenPort => write!(f, "no open port in the capture port range"),
            ProxyError::Bind(err) => write!(f, "proxy bind failed: {}", err),
            ProxyError::Tls(msg) => write!(f, "proxy TLS error: {}", msg),
            ProxyError::DisallowedAddress(addr) => {
                write!(f, "refusing to proxy disallowed address: {}", addr)
            }
            ProxyError::BadGateway(host) => write!(f, "bad gateway: {}", host),
            ProxyError::Io(err) => write!(f, "proxy IO error: {}", err),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

#[derive(Debug)]
pub enum BrowserError {
    Launch(String),
    Navigation(String),
    Script(String),
    Gone,
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserError::Launch(msg) => write!(f, "browser launch failed: {}", msg),
            BrowserError::Navigation(msg) => write!(f, "navigation failed: {}", msg),
            BrowserError::Script(msg) => write!(f, "in-page script failed: {}", msg),
            BrowserError::Gone => write!(f, "browser process has gone away"),
        }
    }
}

impl std::error::Error for BrowserError {}

#[derive(Debug)]
pub enum WarcError {
    Io(std::io::Error),
    QueueClosed,
}

impl fmt::Display for WarcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarcError::Io(err) => write!(f, "warc IO error: {}", err),
            WarcError::QueueClosed => write!(f, "warc writer queue closed"),
        }
    }
}

impl std::error::Error for WarcError {}

impl From<std::io::Error> for WarcError {
    fn from(err: std::io::Error) -> Self {
        WarcError::Io(err)
    }
}

/// Raised inside a capture phase to short-circuit to the finalize block.
#[derive(Debug)]
pub enum CaptureError {
    Halt(String),
    SoftTimeLimit,
    Proxy(ProxyError),
    Browser(BrowserError),
    Warc(WarcError),
    Storage(StorageError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Halt(msg) => write!(f, "capture halted: {}", msg),
            CaptureError::SoftTimeLimit => write!(f, "capture soft time limit exceeded"),
            CaptureError::Proxy(err) => write!(f, "{}", err),
            CaptureError::Browser(err) => write!(f, "{}", err),
            CaptureError::Warc(err) => write!(f, "{}", err),
            CaptureError::Storage(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<ProxyError> for CaptureError {
    fn from(err: ProxyError) -> Self {
        CaptureError::Proxy(err)
    }
}

impl From<BrowserError> for CaptureError {
    fn from(err: BrowserError) -> Self {
        CaptureError::Browser(err)
    }
}

impl From<WarcError> for CaptureError {
    fn from(err: WarcError) -> Self {
        CaptureError::Warc(err)
    }
}

impl From<StorageError> for CaptureError {
    fn from(err: StorageError) -> Self {
        CaptureError::Storage(err)
    }
}

/// How a failed external-archive call should be retried, if at all.
///
/// Connection and concurrent-creation failures retry without consuming any
/// budget; the other classes each draw on their own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveErrorClass {
    Connection,
    RateLimited,
    ConcurrentCreation,
    Http,
}

#[derive(Debug)]
pub struct ArchiveApiError {
    pub class: ArchiveErrorClass,
    pub message: String,
}

impl ArchiveApiError {
    pub fn new(class: ArchiveErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for ArchiveApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "archive API error ({:?}): {}", self.class, self.message)
    }
}

impl std::error::Error for ArchiveApiError {}

#[derive(Debug)]
pub enum ReplicationError {
    Api(ArchiveApiError),
    Storage(StorageError),
    Io(std::io::Error),
    SoftTimeLimit,
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::Api(err) => write!(f, "{}", err),
            ReplicationError::Storage(err) => write!(f, "{}", err),
            ReplicationError::Io(err) => write!(f, "replication IO error: {}", err),
            ReplicationError::SoftTimeLimit => write!(f, "replication soft time limit exceeded"),
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<ArchiveApiError> for ReplicationError {
    fn from(err: ArchiveApiError) -> Self {
        ReplicationError::Api(err)
    }
}

impl From<StorageError> for ReplicationError {
    fn from(err: StorageError) -> Self {
        ReplicationError::Storage(err)
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Io(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    Storage(StorageError),
    Replication(ReplicationError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Config(err) => write!(f, "{}", err),
            ControllerError::Storage(err) => write!(f, "{}", err),
            ControllerError::Replication(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::Config(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::Storage(err)
    }
}

impl From<ReplicationError> for ControllerError {
    fn from(err: ReplicationError) -> Self {
        ControllerError::Replication(err)
    }
}
