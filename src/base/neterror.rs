use thiserror::Error;

/// Error taxonomy a terminal failure is classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Handshake or negotiation failure while opening a connection.
    ConnectionEstablishment,
    /// Certificate or TLS trust failure. Never retried, never downgraded.
    Security,
    /// Per-key connection cap reached and no wait permitted (or the wait timed out).
    PoolExhaustion,
    /// Stream-level reset, frame or flow-control violation.
    Protocol,
    /// Read/write failure on an established connection.
    Transport,
    /// Redirect chain too long, cyclic, or pointing somewhere unsafe.
    RedirectPolicy,
    /// Retry budget spent; the wrapped error is the last one observed.
    RetryExhausted,
    /// The request itself cannot be sent (bad URL, unsupported scheme).
    InvalidRequest,
    /// The owning session was closed.
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy, Hash)]
pub enum NetError {
    // Generic
    #[error("Operation aborted")]
    Aborted,
    #[error("Operation timed out")]
    TimedOut,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("SSL version or cipher mismatch")]
    SslVersionOrCipherMismatch,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("ALPN negotiation failed")]
    AlpnNegotiationFailed,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("SSL pinned key not in cert chain")]
    SslPinnedKeyNotInCertChain,

    // Certificate Errors
    #[error("Certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("Certificate date invalid")]
    CertDateInvalid,
    #[error("Certificate authority invalid")]
    CertAuthorityInvalid,
    #[error("Certificate revoked")]
    CertRevoked,
    #[error("Certificate invalid")]
    CertInvalid,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Unsafe redirect")]
    UnsafeRedirect,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Empty response")]
    EmptyResponse,
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("HTTP/2 server refused stream")]
    Http2ServerRefusedStream,
    #[error("HTTP/2 PING failed")]
    Http2PingFailed,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("QUIC protocol error")]
    QuicProtocolError,
    #[error("QUIC handshake failed")]
    QuicHandshakeFailed,
    #[error("HTTP/2 flow control error")]
    Http2FlowControlError,
    #[error("Too many retries")]
    TooManyRetries,
    #[error("HTTP/2 stream closed")]
    Http2StreamClosed,

    // Session layer errors (custom codes starting at -10000)
    #[error("Redirect cycle detected")]
    RedirectCycleDetected,
    #[error("Socket closed by remote")]
    SocketRemoteClosed,
    #[error("Data received unexpectedly on idle socket")]
    DataReceivedUnexpectedly,
    #[error("Connection pool exhausted")]
    PoolExhausted,
    #[error("No stream capacity on connection")]
    NoStreamCapacity,
    #[error("Connection failed after partial response")]
    PartialResponse,
    #[error("Session closed")]
    SessionClosed,
    #[error("Stream reset")]
    StreamReset,
    #[error("Request body already consumed")]
    RequestBodyConsumed,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Aborted => -3,
            NetError::TimedOut => -7,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::SslProtocolError => -107,
            NetError::AddressUnreachable => -109,
            NetError::TunnelConnectionFailed => -111,
            NetError::SocketNotConnected => -112,
            NetError::SslVersionOrCipherMismatch => -113,
            NetError::ConnectionTimedOut => -118,
            NetError::AlpnNegotiationFailed => -122,
            NetError::ProxyConnectionFailed => -130,
            NetError::SslPinnedKeyNotInCertChain => -150,

            NetError::CertCommonNameInvalid => -200,
            NetError::CertDateInvalid => -201,
            NetError::CertAuthorityInvalid => -202,
            NetError::CertRevoked => -206,
            NetError::CertInvalid => -207,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::UnsafeRedirect => -311,
            NetError::InvalidResponse => -320,
            NetError::EmptyResponse => -324,
            NetError::Http2ProtocolError => -337,
            NetError::Http2ServerRefusedStream => -351,
            NetError::Http2PingFailed => -352,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::QuicProtocolError => -356,
            NetError::QuicHandshakeFailed => -358,
            NetError::Http2FlowControlError => -361,
            NetError::TooManyRetries => -375,
            NetError::Http2StreamClosed => -376,

            NetError::RedirectCycleDetected => -10000,
            NetError::SocketRemoteClosed => -10001,
            NetError::DataReceivedUnexpectedly => -10002,
            NetError::PoolExhausted => -10003,
            NetError::NoStreamCapacity => -10004,
            NetError::PartialResponse => -10005,
            NetError::SessionClosed => -10006,
            NetError::StreamReset => -10007,
            NetError::RequestBodyConsumed => -10008,
            NetError::Unknown(code) => *code,
        }
    }

    /// Classify this error under the session error taxonomy.
    pub fn class(&self) -> ErrorClass {
        use NetError::*;
        match self {
            ConnectionRefused
            | ConnectionFailed
            | NameNotResolved
            | SslProtocolError
            | AddressUnreachable
            | TunnelConnectionFailed
            | SslVersionOrCipherMismatch
            | ConnectionTimedOut
            | AlpnNegotiationFailed
            | ProxyConnectionFailed
            | QuicHandshakeFailed => ErrorClass::ConnectionEstablishment,

            CertCommonNameInvalid
            | CertDateInvalid
            | CertAuthorityInvalid
            | CertRevoked
            | CertInvalid
            | SslPinnedKeyNotInCertChain => ErrorClass::Security,

            PoolExhausted => ErrorClass::PoolExhaustion,

            Http2ProtocolError
            | Http2ServerRefusedStream
            | Http2FlowControlError
            | Http2StreamClosed
            | QuicProtocolError
            | StreamReset
            | NoStreamCapacity
            | InvalidResponse
            | ContentLengthMismatch
            | IncompleteChunkedEncoding => ErrorClass::Protocol,

            InvalidRedirect | TooManyRedirects | UnsafeRedirect | RedirectCycleDetected => {
                ErrorClass::RedirectPolicy
            }

            TooManyRetries => ErrorClass::RetryExhausted,

            InvalidUrl | DisallowedUrlScheme | UnknownUrlScheme | RequestBodyConsumed => {
                ErrorClass::InvalidRequest
            }

            SessionClosed => ErrorClass::Shutdown,

            Aborted
            | TimedOut
            | ConnectionClosed
            | ConnectionReset
            | ConnectionAborted
            | SocketNotConnected
            | EmptyResponse
            | Http2PingFailed
            | SocketRemoteClosed
            | DataReceivedUnexpectedly
            | PartialResponse
            | Unknown(_) => ErrorClass::Transport,
        }
    }

    /// Whether this error is a certificate/trust failure.
    pub fn is_security(&self) -> bool {
        self.class() == ErrorClass::Security
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -3 => NetError::Aborted,
            -7 => NetError::TimedOut,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -109 => NetError::AddressUnreachable,
            -111 => NetError::TunnelConnectionFailed,
            -112 => NetError::SocketNotConnected,
            -113 => NetError::SslVersionOrCipherMismatch,
            -118 => NetError::ConnectionTimedOut,
            -122 => NetError::AlpnNegotiationFailed,
            -130 => NetError::ProxyConnectionFailed,
            -150 => NetError::SslPinnedKeyNotInCertChain,

            -200 => NetError::CertCommonNameInvalid,
            -201 => NetError::CertDateInvalid,
            -202 => NetError::CertAuthorityInvalid,
            -206 => NetError::CertRevoked,
            -207 => NetError::CertInvalid,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -311 => NetError::UnsafeRedirect,
            -320 => NetError::InvalidResponse,
            -324 => NetError::EmptyResponse,
            -337 => NetError::Http2ProtocolError,
            -351 => NetError::Http2ServerRefusedStream,
            -352 => NetError::Http2PingFailed,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -356 => NetError::QuicProtocolError,
            -358 => NetError::QuicHandshakeFailed,
            -361 => NetError::Http2FlowControlError,
            -375 => NetError::TooManyRetries,
            -376 => NetError::Http2StreamClosed,

            -10000 => NetError::RedirectCycleDetected,
            -10001 => NetError::SocketRemoteClosed,
            -10002 => NetError::DataReceivedUnexpectedly,
            -10003 => NetError::PoolExhausted,
            -10004 => NetError::NoStreamCapacity,
            -10005 => NetError::PartialResponse,
            -10006 => NetError::SessionClosed,
            -10007 => NetError::StreamReset,
            -10008 => NetError::RequestBodyConsumed,
            _ => NetError::Unknown(code),
        }
    }
}
