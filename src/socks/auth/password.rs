//! Username/password authentication (RFC 1929)

use crate::config::SocksAuthConfig;
use crate::error::Socks5Error;
use crate::socks::consts::SOCKS5_AUTH_VERSION;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Run the RFC 1929 exchange against the configured credentials
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
pub async fn authenticate_password<S>(stream: &mut S, config: &SocksAuthConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (Some(expected_user), Some(expected_pass)) = (&config.username, &config.password) else {
        send_auth_result(stream, AUTH_FAILURE).await?;
        bail!("SOCKS5 credentials not configured");
    };

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_AUTH_VERSION {
        send_auth_result(stream, AUTH_FAILURE).await?;
        bail!("Invalid auth version: {}", buf[0]);
    }

    let mut username = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut username).await?;

    let password_len = stream.read_u8().await? as usize;
    let mut password = vec![0u8; password_len];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8(username).context("Invalid UTF-8 in username")?;
    if username.as_bytes() == expected_user.as_bytes() && password == expected_pass.as_bytes() {
        send_auth_result(stream, AUTH_SUCCESS).await?;
        tracing::debug!("SOCKS5 user {} authenticated", username);
        Ok(())
    } else {
        send_auth_result(stream, AUTH_FAILURE).await?;
        Err(Socks5Error::AuthFailed).with_context(|| format!("Rejected SOCKS5 user {}", username))
    }
}

async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, password: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        request
    }

    fn config() -> SocksAuthConfig {
        SocksAuthConfig {
            auth_required: true,
            username: Some("testuser".to_string()),
            password: Some("testpass".to_string()),
        }
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&request("testuser", "testpass"))
            .await
            .unwrap();

        authenticate_password(&mut server, &config()).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS5_AUTH_VERSION, AUTH_SUCCESS]);
    }

    #[tokio::test]
    async fn test_authenticate_wrong_password() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&request("testuser", "nope"))
            .await
            .unwrap();

        let err = authenticate_password(&mut server, &config())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::AuthFailed)
        ));
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], AUTH_FAILURE);
    }

    #[tokio::test]
    async fn test_authenticate_invalid_version() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut bad = request("testuser", "testpass");
        bad[0] = 0xFF;
        client.write_all(&bad).await.unwrap();

        let err = authenticate_password(&mut server, &config())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid auth version"));
    }

    #[tokio::test]
    async fn test_scripted_exchange() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&request("testuser", "testpass"))
            .write(&[SOCKS5_AUTH_VERSION, AUTH_SUCCESS])
            .build();
        authenticate_password(&mut stream, &config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_credentials_rejects_without_reading() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[SOCKS5_AUTH_VERSION, AUTH_FAILURE])
            .build();
        let config = SocksAuthConfig {
            auth_required: true,
            ..Default::default()
        };
        assert!(authenticate_password(&mut stream, &config).await.is_err());
    }
}
