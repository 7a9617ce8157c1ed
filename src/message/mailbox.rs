use std::collections::{BTreeMap, VecDeque};

use log::{debug, error};

use super::comm::Communicator;
use super::envelope::Message;
use crate::error::Result;

/// Enforces step ordering on incoming messages. Messages which arrive for a
/// future step are kept until the local scheduler has reached that step;
/// messages for a step which has already finished are dropped.
///
#[derive(Debug, Default)]
pub struct Mailbox {
    step: u64,
    buffer: BTreeMap<u64, VecDeque<Message>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Move to the given step, discarding anything buffered for earlier
    /// ones.
    pub fn start(&mut self, step: u64) {
        self.step = step;
        let stale: Vec<u64> = self.buffer.range(..step).map(|(&s, _)| s).collect();

        for s in stale {
            if let Some(msgs) = self.buffer.remove(&s) {
                error!("dropping {} messages left over from step {}", msgs.len(), s);
            }
        }
        if let Some(msgs) = self.buffer.get(&step) {
            debug!("{} messages were buffered for step {}", msgs.len(), step);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.values().map(VecDeque::len).sum()
    }

    /// Block until a message for the current step (or an abort) arrives.
    pub fn recv<C: Communicator>(&mut self, comm: &C) -> Result<Message> {
        if let Some(message) = self.pop_current() {
            return Ok(message)
        }
        loop {
            let message = Message::decode(&comm.recv()?)?;

            if let Some(message) = self.sort(message) {
                return Ok(message)
            }
        }
    }

    /// Return a message for the current step (or an abort) if one has
    /// already arrived.
    pub fn try_recv<C: Communicator>(&mut self, comm: &C) -> Result<Option<Message>> {
        if let Some(message) = self.pop_current() {
            return Ok(Some(message))
        }
        while let Some(bytes) = comm.try_recv()? {
            if let Some(message) = self.sort(Message::decode(&bytes)?) {
                return Ok(Some(message))
            }
        }
        Ok(None)
    }

    fn pop_current(&mut self) -> Option<Message> {
        let msgs = self.buffer.get_mut(&self.step)?;
        let message = msgs.pop_front();

        if msgs.is_empty() {
            self.buffer.remove(&self.step);
        }
        message
    }

    fn sort(&mut self, message: Message) -> Option<Message> {
        match message.step() {
            Some(step) if step < self.step => {
                error!("received a message for step {} during step {}; dropping it", step, self.step);
                None
            }
            Some(step) if step > self.step => {
                debug!("message received for a future step ({}), buffering", step);
                self.buffer.entry(step).or_default().push_back(message);
                None
            }
            _ => Some(message),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Mailbox;
    use crate::message::comm::Communicator;
    use crate::message::envelope::Message;
    use crate::message::local::ChannelCommunicator;

    fn ack(step: u64, id: usize) -> Vec<u8> {
        Message::Ack { step, id }.encode().unwrap()
    }

    #[test]
    fn future_messages_wait_and_stale_ones_are_dropped() {
        let comm = ChannelCommunicator::group(1).remove(0);
        let mut mailbox = Mailbox::new();
        mailbox.start(1);

        comm.send(0, ack(2, 7)).unwrap();
        comm.send(0, ack(0, 8)).unwrap();
        comm.send(0, ack(1, 9)).unwrap();

        assert_eq!(mailbox.recv(&comm).unwrap(), Message::Ack { step: 1, id: 9 });
        assert_eq!(mailbox.try_recv(&comm).unwrap(), None);
        assert_eq!(mailbox.buffered(), 1);

        mailbox.start(2);
        assert_eq!(mailbox.try_recv(&comm).unwrap(), Some(Message::Ack { step: 2, id: 7 }));
        assert_eq!(mailbox.buffered(), 0);
    }

    #[test]
    fn aborts_are_delivered_in_any_step() {
        let comm = ChannelCommunicator::group(1).remove(0);
        let mut mailbox = Mailbox::new();
        mailbox.start(5);
        comm.send(0, ack(6, 0)).unwrap();
        comm.send(0, Message::Abort { origin: 0, reason: "stop".to_string() }.encode().unwrap()).unwrap();
        assert!(matches!(mailbox.recv(&comm).unwrap(), Message::Abort { .. }));
    }
}
