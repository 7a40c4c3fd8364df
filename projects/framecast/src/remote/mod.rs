pub mod client;
pub mod framing;
pub mod messages;
pub mod model;
pub mod server;

pub use client::RemoteClient;
pub use messages::{Envelope, NotificationMessage, RequestMessage, ResponseMessage};
pub use model::RemoteModel;
pub use server::RemoteServer;

use crate::error::{FramecastError, Result};

/// `tcp://host:port` to the `host:port` tokio expects.
pub fn socket_addr(endpoint: &str) -> Result<&str> {
    match endpoint.strip_prefix("tcp://") {
        Some(addr) if !addr.is_empty() => Ok(addr),
        _ => Err(FramecastError::invalid(format!(
            "unsupported endpoint '{endpoint}', expected tcp://host:port"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        assert_eq!(socket_addr("tcp://127.0.0.1:5555").unwrap(), "127.0.0.1:5555");
        assert!(socket_addr("ipc:///tmp/sock").is_err());
        assert!(socket_addr("tcp://").is_err());
    }
}
