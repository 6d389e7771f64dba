//! Error types for Calimero operations.
//!
//! This module provides structured error types with backtraces and helper
//! methods for error information, following the same nested-kind pattern
//! throughout: a public outer enum whose variants wrap a private `kind` plus
//! an optional captured backtrace, with crate-private constructors so call
//! sites never build the inner structs directly.

use std::backtrace::Backtrace;
use std::fmt;

/// Result type alias for Calimero operations.
pub type Result<T> = std::result::Result<T, CalimeroError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Link-layer error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkErrorKind {
    InvalidFrame,
    InvalidControlField,
    InvalidMessageCode,
    BufferTooSmall,
    PayloadTooLarge,
    Closed,
    SendFailed,
    ReceiveFailed,
}

/// Transport-layer (TL4) error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportErrorKind {
    NotConnected,
    AlreadyConnecting,
    ForeignDestination,
    SequenceMismatch,
    AckFailed,
    Disconnected,
    RetriesExhausted,
}

/// Secure Application Layer error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SecureErrorKind {
    InvalidScf,
    SeqNoError,
    Mac,
    AccessAndRoleError,
    NoKey,
    SyncTimeout,
    SyncThrottled,
}

/// Wire-format error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FormatErrorKind {
    UnsupportedVersion,
    UnsupportedServiceType,
    InvalidAddress,
    InvalidConfig,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// Calimero error type.
///
/// This is the main error type returned by all Calimero operations. It
/// carries a backtrace captured at the error site and exposes predicate
/// methods (`is_*`) on the nested structs so callers can match narrowly
/// without depending on the private `kind` representation.
#[derive(Debug)]
pub enum CalimeroError {
    /// Network Link errors (frame parsing, closed link, medium I/O).
    Link(LinkError),
    /// Transport Layer errors (connection state, acknowledgment, retries).
    Transport(TransportError),
    /// Secure Application Layer errors (crypto, replay, sync).
    Secure(SecureError),
    /// Wire-format / configuration errors.
    Format(FormatError),
    /// Caller supplied an argument outside its valid domain.
    InvalidArgument,
    /// Operation invoked while the owning component was in the wrong state.
    IllegalState,
    /// A suspending operation did not complete before its deadline.
    Timeout,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Link error with captured backtrace.
#[derive(Debug)]
pub struct LinkError {
    kind: LinkErrorKind,
    backtrace: Backtrace,
}

impl LinkError {
    pub(crate) fn new(kind: LinkErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if this is a closed-link error.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, LinkErrorKind::Closed)
    }

    /// Check if this is a malformed-frame error.
    pub fn is_invalid_frame(&self) -> bool {
        matches!(self.kind, LinkErrorKind::InvalidFrame)
    }
}

/// Transport error with captured backtrace.
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    backtrace: Backtrace,
}

impl TransportError {
    pub(crate) fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check whether the destination disconnected mid-operation.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Disconnected)
    }

    /// Check whether all retransmissions were exhausted.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self.kind, TransportErrorKind::RetriesExhausted)
    }
}

/// Secure Application Layer error with captured backtrace.
#[derive(Debug)]
pub struct SecureError {
    kind: SecureErrorKind,
    backtrace: Backtrace,
}

impl SecureError {
    pub(crate) fn new(kind: SecureErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check whether the Secure Control Field carried an unsupported value.
    pub fn is_invalid_scf(&self) -> bool {
        matches!(self.kind, SecureErrorKind::InvalidScf)
    }

    /// Check whether the frame failed the sequence-number replay check.
    pub fn is_seq_no_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::SeqNoError)
    }

    /// Check whether MAC verification or decryption failed.
    pub fn is_mac_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::Mac)
    }

    /// Check whether the access/role check rejected the frame.
    pub fn is_access_and_role_error(&self) -> bool {
        matches!(self.kind, SecureErrorKind::AccessAndRoleError)
    }

    /// Check whether a `sync.req` was dropped by the response throttle.
    pub fn is_sync_throttled(&self) -> bool {
        matches!(self.kind, SecureErrorKind::SyncThrottled)
    }
}

/// Wire-format error with captured backtrace.
#[derive(Debug)]
pub struct FormatError {
    kind: FormatErrorKind,
    backtrace: Backtrace,
}

impl FormatError {
    pub(crate) fn new(kind: FormatErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check whether an IP/group/individual address string failed to parse.
    pub fn is_invalid_address(&self) -> bool {
        matches!(self.kind, FormatErrorKind::InvalidAddress)
    }
}

// =============================================================================
// Convenience Constructors for CalimeroError
// =============================================================================

impl CalimeroError {
    // Link errors
    pub(crate) fn invalid_frame() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::InvalidFrame))
    }

    pub(crate) fn invalid_control_field() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::InvalidControlField))
    }

    pub(crate) fn invalid_message_code() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::InvalidMessageCode))
    }

    pub(crate) fn buffer_too_small() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::BufferTooSmall))
    }

    pub(crate) fn payload_too_large() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::PayloadTooLarge))
    }

    pub(crate) fn link_closed() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::Closed))
    }

    pub(crate) fn send_failed() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::SendFailed))
    }

    pub(crate) fn receive_failed() -> Self {
        Self::Link(LinkError::new(LinkErrorKind::ReceiveFailed))
    }

    // Transport errors
    pub(crate) fn not_connected() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::NotConnected))
    }

    pub(crate) fn already_connecting() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::AlreadyConnecting))
    }

    pub(crate) fn foreign_destination() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::ForeignDestination))
    }

    pub(crate) fn sequence_mismatch() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::SequenceMismatch))
    }

    pub(crate) fn ack_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::AckFailed))
    }

    pub(crate) fn disconnect() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Disconnected))
    }

    pub(crate) fn retries_exhausted() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::RetriesExhausted))
    }

    // Secure Application Layer errors
    pub(crate) fn invalid_scf() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::InvalidScf))
    }

    pub(crate) fn seq_no_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SeqNoError))
    }

    pub(crate) fn mac_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::Mac))
    }

    pub(crate) fn access_and_role_error() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::AccessAndRoleError))
    }

    pub(crate) fn no_key() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::NoKey))
    }

    pub(crate) fn sync_timeout() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SyncTimeout))
    }

    pub(crate) fn sync_throttled() -> Self {
        Self::Secure(SecureError::new(SecureErrorKind::SyncThrottled))
    }

    // Format errors
    pub(crate) fn unsupported_version() -> Self {
        Self::Format(FormatError::new(FormatErrorKind::UnsupportedVersion))
    }

    pub(crate) fn unsupported_service_type() -> Self {
        Self::Format(FormatError::new(FormatErrorKind::UnsupportedServiceType))
    }

    pub(crate) fn invalid_address() -> Self {
        Self::Format(FormatError::new(FormatErrorKind::InvalidAddress))
    }

    pub(crate) fn invalid_config() -> Self {
        Self::Format(FormatError::new(FormatErrorKind::InvalidConfig))
    }

    pub(crate) fn invalid_argument() -> Self {
        Self::InvalidArgument
    }

    /// Check whether this error represents a suspending operation timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check whether this error represents a permanently closed link.
    pub fn is_link_closed(&self) -> bool {
        matches!(self, Self::Link(e) if e.is_closed())
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for CalimeroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(e) => write!(f, "link error: {:?}", e.kind),
            Self::Transport(e) => write!(f, "transport error: {:?}", e.kind),
            Self::Secure(e) => write!(f, "secure application layer error: {:?}", e.kind),
            Self::Format(e) => write!(f, "format error: {:?}", e.kind),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::IllegalState => write!(f, "illegal state"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for CalimeroError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_does_not_panic_for_every_variant() {
        let errors = [
            CalimeroError::invalid_frame(),
            CalimeroError::link_closed(),
            CalimeroError::not_connected(),
            CalimeroError::disconnect(),
            CalimeroError::invalid_scf(),
            CalimeroError::seq_no_error(),
            CalimeroError::mac_error(),
            CalimeroError::invalid_address(),
            CalimeroError::InvalidArgument,
            CalimeroError::IllegalState,
            CalimeroError::Timeout,
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn predicate_methods_match_their_constructor() {
        assert!(CalimeroError::link_closed().is_link_closed());
        assert!(CalimeroError::Timeout.is_timeout());
        match CalimeroError::seq_no_error() {
            CalimeroError::Secure(e) => assert!(e.is_seq_no_error()),
            _ => panic!("expected Secure variant"),
        }
    }
}
