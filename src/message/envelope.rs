use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The messages exchanged by schedulers. Transfers and their
/// acknowledgements are tagged with the step they belong to; an abort
/// applies to whatever step its receiver is in.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Transfer { step: u64, id: usize, payload: Vec<u8> },
    Ack { step: u64, id: usize },
    Abort { origin: usize, reason: String },
}

impl Message {
    pub fn step(&self) -> Option<u64> {
        match self {
            Message::Transfer { step, .. } | Message::Ack { step, .. } => Some(*step),
            Message::Abort { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::TransferFailure(format!("failed to encode message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::TransferFailure(format!("failed to decode message: {}", e)))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Message;

    #[test]
    fn messages_survive_the_wire_and_garbage_does_not() {
        let message = Message::Transfer { step: 4, id: 2, payload: vec![0, 255, 17] };
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
        assert_eq!(message.step(), Some(4));
        assert_eq!(Message::Abort { origin: 1, reason: String::new() }.step(), None);
        assert!(Message::decode(&[0xc1]).unwrap_err().is_transfer_failure());
    }
}
