//! Error types for tunlink
//!
//! Errors raised while establishing the tunnel are [`NativeError`]s: a kind
//! drawn from a fixed taxonomy plus an optional detail message. Every kind is
//! either *expected* (the user or the environment can fix it) or a *red flag*
//! that deserves a crash report.

use thiserror::Error;

/// Main error type for the tunlink application
#[derive(Error, Debug)]
pub enum TunlinkError {
    /// Errors raised while establishing or running the tunnel
    #[error(transparent)]
    Native(#[from] NativeError),

    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Whether an error is routine or worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// User-actionable or environmental, e.g. a wrong password
    Expected,
    /// Unexpected failure, e.g. the routing daemon refusing the routing table
    RedFlag,
}

/// The native error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    Unexpected,
    VpnPermissionNotGranted,
    InvalidServerCredentials,
    RemoteUdpForwardingDisabled,
    ServerUnreachable,
    VpnStartFailure,
    IllegalServerConfiguration,
    ShadowsocksStartFailure,
    ConfigureSystemProxyFailure,
    NoAdminPermissions,
    UnsupportedRoutingTable,
    SystemConfigurationException,
}

impl NativeErrorKind {
    const ALL: [NativeErrorKind; 12] = [
        NativeErrorKind::Unexpected,
        NativeErrorKind::VpnPermissionNotGranted,
        NativeErrorKind::InvalidServerCredentials,
        NativeErrorKind::RemoteUdpForwardingDisabled,
        NativeErrorKind::ServerUnreachable,
        NativeErrorKind::VpnStartFailure,
        NativeErrorKind::IllegalServerConfiguration,
        NativeErrorKind::ShadowsocksStartFailure,
        NativeErrorKind::ConfigureSystemProxyFailure,
        NativeErrorKind::NoAdminPermissions,
        NativeErrorKind::UnsupportedRoutingTable,
        NativeErrorKind::SystemConfigurationException,
    ];

    /// Severity of this kind of error
    pub fn severity(self) -> Severity {
        match self {
            NativeErrorKind::ShadowsocksStartFailure
            | NativeErrorKind::ConfigureSystemProxyFailure
            | NativeErrorKind::UnsupportedRoutingTable
            | NativeErrorKind::VpnStartFailure => Severity::RedFlag,
            _ => Severity::Expected,
        }
    }

    /// Stable numeric error code shared with the other clients
    pub fn code(self) -> i32 {
        match self {
            NativeErrorKind::Unexpected => 1,
            NativeErrorKind::VpnPermissionNotGranted => 2,
            NativeErrorKind::InvalidServerCredentials => 3,
            NativeErrorKind::RemoteUdpForwardingDisabled => 4,
            NativeErrorKind::ServerUnreachable => 5,
            NativeErrorKind::VpnStartFailure => 6,
            NativeErrorKind::IllegalServerConfiguration => 7,
            NativeErrorKind::ShadowsocksStartFailure => 8,
            NativeErrorKind::ConfigureSystemProxyFailure => 9,
            NativeErrorKind::NoAdminPermissions => 10,
            NativeErrorKind::UnsupportedRoutingTable => 11,
            NativeErrorKind::SystemConfigurationException => 12,
        }
    }

    /// Inverse of [`NativeErrorKind::code`]; `0` (no error) and unknown codes yield `None`
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    fn description(self) -> &'static str {
        match self {
            NativeErrorKind::Unexpected => "unexpected error",
            NativeErrorKind::VpnPermissionNotGranted => "VPN permission not granted",
            NativeErrorKind::InvalidServerCredentials => "invalid server credentials",
            NativeErrorKind::RemoteUdpForwardingDisabled => "remote UDP forwarding disabled",
            NativeErrorKind::ServerUnreachable => "server unreachable",
            NativeErrorKind::VpnStartFailure => "VPN failed to start",
            NativeErrorKind::IllegalServerConfiguration => "illegal server configuration",
            NativeErrorKind::ShadowsocksStartFailure => "Shadowsocks client failed to start",
            NativeErrorKind::ConfigureSystemProxyFailure => "could not configure system proxy",
            NativeErrorKind::NoAdminPermissions => "administrator permissions not granted",
            NativeErrorKind::UnsupportedRoutingTable => "unsupported routing table",
            NativeErrorKind::SystemConfigurationException => "system misconfigured",
        }
    }
}

impl std::fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// An error raised while establishing or running the tunnel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    kind: NativeErrorKind,
    message: Option<String>,
}

impl NativeError {
    /// Create an error of the given kind without detail
    pub fn new(kind: NativeErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Create an error of the given kind with a detail message
    pub fn with_message(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> NativeErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// True for errors that should be reported rather than just shown
    pub fn is_red_flag(&self) -> bool {
        self.severity() == Severity::RedFlag
    }

    pub fn server_unreachable(message: impl Into<String>) -> Self {
        Self::with_message(NativeErrorKind::ServerUnreachable, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::with_message(NativeErrorKind::InvalidServerCredentials, message)
    }

    pub fn udp_forwarding_disabled(message: impl Into<String>) -> Self {
        Self::with_message(NativeErrorKind::RemoteUdpForwardingDisabled, message)
    }

    pub fn system_configuration(message: impl Into<String>) -> Self {
        Self::with_message(NativeErrorKind::SystemConfigurationException, message)
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("Helper binary not found: {name}")]
    BinaryNotFound { name: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TunlinkError>;
