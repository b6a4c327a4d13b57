//! Default values shared by all receivers

use std::time::Duration;

/// Default time to wait for the first message of a batch if the caller doesn't specify one
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(60);

/// Default time to wait for the remote peer to settle a disposition
pub const DEFAULT_SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Description used when the link reports a failure without an error
pub const RECEIVE_ERROR_DESCRIPTION: &str = "An error occurred while receiving messages.";

/// Error condition returned by Service Bus when the entity is throttled
pub const SERVER_BUSY: &str = "com.microsoft:server-busy";

/// Error condition returned by Service Bus when an operation times out on the broker
pub const SERVER_TIMEOUT: &str = "com.microsoft:timeout";
