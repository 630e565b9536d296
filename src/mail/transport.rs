//! Blocking line-oriented TCP/TLS stream shared by the IMAP and POP3 sessions.
//!
//! Both wire protocols are CRLF-terminated command/response exchanges, so the
//! sessions only need: connect (optionally over rustls), read a line, read an
//! exact number of bytes, write a line. Run everything here inside
//! `spawn_blocking`.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::MailError;

/// Plain or TLS-wrapped socket.
enum MailStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for MailStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for MailStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// A buffered, line-oriented connection to a mail server.
pub struct LineStream {
    reader: BufReader<MailStream>,
    timeout: Duration,
    protocol: &'static str,
}

impl LineStream {
    /// Open a TCP connection, wrapping it in TLS when `use_tls` is set.
    pub fn connect(
        host: &str,
        port: u16,
        use_tls: bool,
        timeout: Duration,
        protocol: &'static str,
    ) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: host.to_string(),
            port,
            reason,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host did not resolve".into()))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| map_io(e, timeout))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let stream = if use_tls {
            MailStream::Tls(Box::new(wrap_tls(host, tcp)?))
        } else {
            MailStream::Plain(tcp)
        };

        Ok(Self {
            reader: BufReader::new(stream),
            timeout,
            protocol,
        })
    }

    /// Read one line as raw bytes, CRLF included.
    pub fn read_line_bytes(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| map_io(e, self.timeout))?;
        if n == 0 {
            return Err(MailError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("{} connection closed by server", self.protocol),
            )));
        }
        Ok(buf)
    }

    /// Read one line as text with the line terminator stripped.
    pub fn read_line(&mut self) -> Result<String, MailError> {
        let bytes = self.read_line_bytes()?;
        Ok(String::from_utf8_lossy(&bytes)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    /// Read exactly `len` bytes (IMAP literals).
    pub fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>, MailError> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| map_io(e, self.timeout))?;
        Ok(buf)
    }

    /// Write a command line, appending CRLF.
    pub fn write_line(&mut self, line: &str) -> Result<(), MailError> {
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| map_io(e, self.timeout))
    }
}

fn wrap_tls(
    host: &str,
    tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>, MailError> {
    let tls_err = |reason: String| MailError::Tls {
        host: host.to_string(),
        reason,
    };

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| tls_err(e.to_string()))?;
    let conn = ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| tls_err(e.to_string()))?;

    Ok(StreamOwned::new(conn, tcp))
}

fn map_io(err: std::io::Error, timeout: Duration) -> MailError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => MailError::Timeout(timeout),
        _ => MailError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn reads_lines_and_literals_over_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"+OK ready\r\nabcdef").unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"QUIT\r\n");
        });

        let mut stream =
            LineStream::connect("127.0.0.1", port, false, Duration::from_secs(5), "POP3").unwrap();
        assert_eq!(stream.read_line().unwrap(), "+OK ready");
        assert_eq!(stream.read_exact_bytes(6).unwrap(), b"abcdef");
        stream.write_line("QUIT").unwrap();
        server.join().unwrap();
    }

    #[test]
    fn closed_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
        });

        let mut stream =
            LineStream::connect("127.0.0.1", port, false, Duration::from_secs(5), "IMAP").unwrap();
        server.join().unwrap();
        match stream.read_line() {
            Err(MailError::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected EOF error, got {other:?}"),
        }
    }
}
