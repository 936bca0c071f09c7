/// The current state of a logical request.
/// Each non-idle variant corresponds to a point where the request may suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle.
    #[default]
    Idle,

    /// Waiting for a connection slot from the pool.
    WaitingForAvailableConnection,

    /// Waiting out a retry backoff.
    WaitingForRetry,

    /// Sending the HTTP request.
    SendingRequest,

    /// Waiting for the server response and draining its body.
    WaitingForResponse,
}
