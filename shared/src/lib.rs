//! Wire protocol and domain types shared by the quiz duel server and client

pub mod codec;
pub mod protocol;
pub mod types;

pub use codec::{read_frame, write_frame, FrameError};
pub use protocol::{ClientMessage, ServerMessage};
pub use types::*;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Protocol revision a client announces in `Authenticate`
pub const PROTOCOL_VERSION: u32 = 1;

/// Current wall-clock time in milliseconds since the UNIX epoch
pub fn epoch_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_advances() {
        let first = epoch_millis();
        std::thread::sleep(Duration::from_millis(2));
        let second = epoch_millis();
        assert!(second > first);
    }

    #[test]
    fn test_protocol_messages_cross_the_codec() {
        let message = ServerMessage::ValidationError {
            request_id: Some(4),
            message: "step 3 already answered".to_string(),
        };
        let body = codec::encode(&message).unwrap();
        let decoded: ServerMessage = codec::decode(&body).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "validation_error");
    }
}
