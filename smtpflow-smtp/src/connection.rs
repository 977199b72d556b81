use std::{fs::File, io::BufReader as StdBufReader, path::Path, sync::Arc};

use serde::Deserialize;
use smtpflow_common::internal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        crypto::aws_lc_rs,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::error::{ConnectionError, ConnectionResult, TlsError, TlsResult};

/// Certificate and key, PEM encoded.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TlsContext {
    pub certificate: std::path::PathBuf,
    pub key: std::path::PathBuf,
}

impl TlsContext {
    /// Load the certificate chain and key once; the acceptor is shared by
    /// every connection of every listener.
    pub fn acceptor(&self) -> TlsResult<TlsAcceptor> {
        let certs = load_certs(&self.certificate).map_err(|e| TlsError::CertificateLoad {
            path: self.certificate.display().to_string(),
            source: e,
        })?;
        let key = load_key(&self.key)?;

        let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut StdBufReader::new(File::open(path)?)).collect()
}

fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.display().to_string();
    let mut reader = StdBufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

#[derive(Debug)]
pub struct TlsInfo {
    version: String,
    cipher: String,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        let version = conn
            .protocol_version()
            .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?;
        let cipher = conn
            .negotiated_cipher_suite()
            .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?;

        Ok(Self {
            version: version.as_str().unwrap_or_default().to_string(),
            cipher: cipher.suite().as_str().unwrap_or_default().to_string(),
        })
    }

    #[must_use]
    pub fn proto(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn cipher(&self) -> &str {
        &self.cipher
    }
}

/// A client connection, line buffered in both modes.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(BufReader<Stream>),
    Tls(Box<BufReader<TlsStream<Stream>>>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self::Plain(BufReader::new(stream))
    }

    /// Implicit TLS: handshake before anything is said.
    pub async fn accept(stream: Stream, acceptor: &TlsAcceptor) -> TlsResult<(Self, TlsInfo)> {
        let stream = acceptor.accept(stream).await?;
        let info = TlsInfo::of(stream.get_ref().1)?;
        Ok((Self::Tls(Box::new(BufReader::new(stream))), info))
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let line = format!("{response}\r\n");

        match self {
            Self::Plain(stream) => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
        }

        Ok(line.len())
    }

    /// Read up to and including the next `\n`, but never more than `limit`
    /// bytes. Returns 0 once the peer has closed the connection.
    pub async fn read_line(&mut self, buf: &mut Vec<u8>, limit: usize) -> ConnectionResult<usize> {
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);

        Ok(match self {
            Self::Plain(stream) => (&mut *stream).take(limit).read_until(b'\n', buf).await?,
            Self::Tls(stream) => (&mut **stream).take(limit).read_until(b'\n', buf).await?,
        })
    }

    /// STARTTLS. Anything the client pipelined after the command is
    /// discarded with the plaintext buffer (RFC 3207 Section 4.2).
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> TlsResult<(Self, TlsInfo)> {
        internal!(level = DEBUG, "Upgrading connection ...");

        match self {
            Self::Plain(reader) => {
                if !reader.buffer().is_empty() {
                    internal!(
                        level = WARN,
                        "Discarding {} bytes pipelined after STARTTLS",
                        reader.buffer().len()
                    );
                }
                Self::accept(reader.into_inner(), acceptor).await
            }
            Self::Tls(_) => Err(TlsError::Io(std::io::Error::other(
                ConnectionError::AlreadySecure,
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn read_line_stops_at_newline_and_limit() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::plain(server);
        let mut client = client;

        client.write_all(b"EHLO client.test\r\nNOOP\r\n0123456789").await.unwrap();
        drop(client);

        let mut line = Vec::new();
        connection.read_line(&mut line, 512).await.unwrap();
        assert_eq!(line, b"EHLO client.test\r\n");

        line.clear();
        connection.read_line(&mut line, 512).await.unwrap();
        assert_eq!(line, b"NOOP\r\n");

        line.clear();
        assert_eq!(connection.read_line(&mut line, 4).await.unwrap(), 4);
        assert_eq!(line, b"0123");

        line.clear();
        connection.read_line(&mut line, 512).await.unwrap();
        assert_eq!(line, b"456789");

        line.clear();
        assert_eq!(connection.read_line(&mut line, 512).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_appends_crlf() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::plain(server);

        assert_eq!(connection.send(&"250 2.0.0 Ok").await.unwrap(), 14);
        drop(connection);

        let mut received = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut received)
            .await
            .unwrap();
        assert_eq!(received, "250 2.0.0 Ok\r\n");
    }

    #[test]
    fn missing_certificate_is_reported() {
        let context = TlsContext {
            certificate: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };

        let err = context.acceptor().err().expect("expected acceptor() to fail");
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn unreadable_key_is_reported() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not a pem file").unwrap();

        let err = load_key(key.path()).unwrap_err();
        assert!(matches!(err, TlsError::KeyLoad { .. }));
        assert!(load_certs(cert.path()).unwrap().is_empty());
    }
}
