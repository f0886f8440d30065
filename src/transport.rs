//! Building per-server HTTP clients and classifying their failures.

use crate::policy::TransportStatus;
use crate::server::Server;

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

/// Build a client that sends everything through `server`, or directly for
/// the no-proxy sentinel.
pub(crate) fn build_client(
    server: &Server,
    timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs);

    let builder = match server.to_reqwest_proxy()? {
        Some(proxy) => builder.proxy(proxy),
        None => builder.no_proxy(),
    };
    builder.build()
}

/// Map a reqwest failure onto a transport status.
pub fn classify(err: &reqwest::Error) -> TransportStatus {
    if err.is_timeout() {
        return TransportStatus::Timeout;
    }

    let mut messages = Vec::new();
    let mut io_kinds = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        messages.push(cause.to_string().to_ascii_lowercase());
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            io_kinds.push(io_err.kind());
        }
        source = cause.source();
    }
    let mentions = |needle: &str| messages.iter().any(|m| m.contains(needle));

    if io_kinds.contains(&io::ErrorKind::TimedOut) {
        return TransportStatus::Timeout;
    }
    if err.is_connect() {
        if mentions("tls") || mentions("ssl") || mentions("certificate") || mentions("handshake") {
            return TransportStatus::TlsFailure;
        }
        return TransportStatus::ConnectFailure;
    }
    if mentions("connection closed before message completed") || mentions("incomplete message") {
        return TransportStatus::EmptyResponse;
    }
    if err.is_body()
        || err.is_decode()
        || io_kinds.iter().any(|kind| {
            matches!(
                kind,
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        })
    {
        return TransportStatus::ReceiveFailure;
    }
    TransportStatus::Other
}
