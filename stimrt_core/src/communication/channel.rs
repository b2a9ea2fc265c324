use super::frame_queue::FrameQueue;
use super::message::Message;
use crate::error::StimResult;
use std::path::Path;

fn inbound_queue(participant: &str) -> String {
    format!("{}.in", participant)
}

fn outbound_queue(participant: &str) -> String {
    format!("{}.out", participant)
}

/// Which side of a participant channel a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    Controller,
    Participant,
}

/// One end of the bidirectional channel between the Controller and a participant.
///
/// The participant receives on `<name>.in` and sends on `<name>.out`; the
/// Controller holds the mirror image. Ordering is per direction only.
#[derive(Debug)]
pub struct ChannelEnd {
    participant: String,
    side: ChannelSide,
    tx: FrameQueue,
    rx: FrameQueue,
}

impl ChannelEnd {
    /// Create both queues and return the Controller's end
    pub fn create(dir: &Path, participant: &str, capacity: usize) -> StimResult<Self> {
        let inbound = FrameQueue::create(dir, &inbound_queue(participant), capacity)?;
        let outbound = FrameQueue::create(dir, &outbound_queue(participant), capacity)?;
        Ok(Self {
            participant: participant.to_string(),
            side: ChannelSide::Controller,
            tx: inbound,
            rx: outbound,
        })
    }

    /// Open the queues of an existing channel from either side
    pub fn open(dir: &Path, participant: &str, side: ChannelSide) -> StimResult<Self> {
        let inbound = FrameQueue::open(dir, &inbound_queue(participant))?;
        let outbound = FrameQueue::open(dir, &outbound_queue(participant))?;
        let (tx, rx) = match side {
            ChannelSide::Controller => (inbound, outbound),
            ChannelSide::Participant => (outbound, inbound),
        };
        Ok(Self {
            participant: participant.to_string(),
            side,
            tx,
            rx,
        })
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn side(&self) -> ChannelSide {
        self.side
    }

    /// Enqueue a message for the other side; fails if closed or full
    pub fn send(&self, message: &Message) -> StimResult<()> {
        self.tx.push(&message.encode()?)
    }

    pub fn try_recv(&self) -> StimResult<Option<Message>> {
        match self.rx.pop() {
            Some(frame) => Message::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Receive everything queued right now, in order.
    ///
    /// Undecodable frames are logged and skipped.
    pub fn drain(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(frame) = self.rx.pop() {
            match Message::decode(&frame) {
                Ok(message) => messages.push(message),
                Err(e) => log::warn!(
                    "dropping undecodable frame on channel '{}': {}",
                    self.participant,
                    e
                ),
            }
        }
        messages
    }

    /// Refuse further traffic towards this end
    pub fn close_receiving(&self) {
        self.rx.close();
    }

    pub fn is_peer_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::RpcCall;
    use crate::error::StimError;

    #[test]
    fn test_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let controller = ChannelEnd::create(dir.path(), "camera", 4096).unwrap();
        let camera = ChannelEnd::open(dir.path(), "camera", ChannelSide::Participant).unwrap();

        controller.send(&Message::Shutdown).unwrap();
        assert_eq!(camera.try_recv().unwrap(), Some(Message::Shutdown));
        assert_eq!(camera.try_recv().unwrap(), None);

        let call = RpcCall::new("controller", "start_protocol").arg("demo").unwrap();
        camera.send(&Message::Rpc(call.clone())).unwrap();
        assert_eq!(controller.drain(), vec![Message::Rpc(call)]);
    }

    #[test]
    fn test_closed_peer_fails_send() {
        let dir = tempfile::tempdir().unwrap();
        let controller = ChannelEnd::create(dir.path(), "io", 4096).unwrap();
        let io = ChannelEnd::open(dir.path(), "io", ChannelSide::Participant).unwrap();
        io.close_receiving();
        assert!(controller.is_peer_closed());
        assert!(matches!(
            controller.send(&Message::Shutdown),
            Err(StimError::ChannelClosed(_))
        ));
    }
}
