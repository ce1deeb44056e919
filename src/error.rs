//! Error types for Tunsocks
//!
//! Typed errors surfaced by the pool, the selector and the front ends.
//! Application edges (config loading, main) use `anyhow` on top of these.

use std::io;
use thiserror::Error;

/// Main error type for Tunsocks operations
#[derive(Error, Debug)]
pub enum TunsocksError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Carrier protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Relay rejected the credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Tunnel could not be established or died
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// A stream could not be opened through a live tunnel
    #[error("Stream error: {0}")]
    Stream(String),

    /// The pool has been shut down
    #[error("Pool closed")]
    PoolClosed,

    /// Proxy selection failed
    #[error(transparent)]
    Select(#[from] SelectError),

    /// A front end with the same identity is already registered
    #[error("duplicated socks server name: {0}")]
    DuplicateFrontEnd(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result alias for [`TunsocksError`]
pub type Result<T, E = TunsocksError> = std::result::Result<T, E>;

/// Proxy selection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// No pool matches the front end's strategy
    #[error("No available client proxy")]
    NoProxyAvailable,

    /// The strategy is recognised but not implemented
    #[error("Unsupported proxy selection strategy: {0}")]
    Unsupported(&'static str),
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// General SOCKS server failure
    #[error("General SOCKS server failure")]
    GeneralFailure,

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Malformed UDP datagram header
    #[error("Malformed UDP datagram: {0}")]
    MalformedDatagram(String),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            _ => Err(Socks5Error::GeneralFailure),
        }
    }
}

impl From<&TunsocksError> for Socks5ReplyCode {
    /// Every routing or tunnel failure is reported to the SOCKS client as a
    /// general failure; the local side cannot see the remote cause.
    fn from(_: &TunsocksError) -> Self {
        Socks5ReplyCode::GeneralFailure
    }
}
