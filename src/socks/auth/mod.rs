//! SOCKS5 method negotiation

mod password;

pub use password::authenticate_password;

use super::consts::*;
use crate::config::SocksAuthConfig;
use crate::error::Socks5Error;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// Negotiate a method with the client and run it
pub async fn authenticate<S>(stream: &mut S, config: &SocksAuthConfig) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let (version, num_methods) = (buf[0], buf[1]);
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected = select_auth_method(&methods, config);
    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected
                .map(AuthMethod::to_byte)
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    let method = selected.ok_or(Socks5Error::NoAcceptableMethod)?;
    if method == AuthMethod::Password {
        authenticate_password(stream, config).await?;
    }

    Ok(method)
}

fn select_auth_method(methods: &[u8], config: &SocksAuthConfig) -> Option<AuthMethod> {
    if config.auth_required {
        return methods
            .contains(&SOCKS5_AUTH_METHOD_PASSWORD)
            .then_some(AuthMethod::Password);
    }

    if methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        Some(AuthMethod::None)
    } else if methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) && config.has_credentials() {
        Some(AuthMethod::Password)
    } else {
        None
    }
}
