use crate::errors::{Error, ProtocolError};
use crate::io::codec::{encode_frame, FrameDecoder};
use crate::io::{from_splitflap, to_splitflap, Ack, FromSplitflap, IoTransport, SplitflapState, ToSplitflap};
use crate::pause_sync;
use parking_lot::Mutex;
use prost::Message;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory transport behaving like a splitflap controller.
///
/// Clones share every buffer, so a test can keep a handle while the session owns the transport.
#[derive(Clone, Debug, Default)]
pub struct MockTransportLayer {
    connected: Arc<AtomicBool>,
    incoming: Arc<Mutex<VecDeque<u8>>>,
    outgoing: Arc<Mutex<Vec<u8>>>,
    /// Answer every valid frame with an [`Ack`] (as the firmware does).
    auto_ack: bool,
    /// Answer every state request with this state.
    state_reply: Option<SplitflapState>,
    /// Number of acks still to be "lost".
    skipped_acks: Arc<AtomicUsize>,
    /// Ack every frame with the nonce that follows its own.
    wrong_acks: bool,
    failing_writes: bool,
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl MockTransportLayer {
    pub fn with_auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn with_state_reply(mut self, state: SplitflapState) -> Self {
        self.state_reply = Some(state);
        self
    }

    /// Drops the next `count` acks the device would have sent.
    pub fn skipping_acks(self, count: usize) -> Self {
        self.skipped_acks.store(count, Ordering::SeqCst);
        self
    }

    pub fn acking_wrong_nonce(mut self) -> Self {
        self.auto_ack = true;
        self.wrong_acks = true;
        self
    }

    pub fn with_failing_writes(mut self) -> Self {
        self.failing_writes = true;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The last read timeout set.
    pub fn get_timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Queues raw bytes as if the device sent them.
    pub fn push_incoming(&self, data: &[u8]) {
        self.incoming.lock().extend(data);
    }

    /// Queues a properly framed message as if the device sent it.
    pub fn push_message(&self, payload: from_splitflap::Payload) {
        let message = FromSplitflap {
            payload: Some(payload),
        };
        self.push_incoming(&encode_frame(&message.encode_to_vec()));
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.outgoing.lock().clone()
    }

    /// Every message written so far, decoded (retries included).
    pub fn sent_messages(&self) -> Vec<ToSplitflap> {
        let mut decoder = FrameDecoder::new();
        self.written()
            .into_iter()
            .filter_map(|byte| decoder.feed(byte))
            .filter_map(|payload| payload.ok())
            .filter_map(|payload| ToSplitflap::decode(payload.as_slice()).ok())
            .collect()
    }

    /// Plays the device role for a frame the host just wrote.
    fn respond(&self, buf: &[u8]) {
        let mut decoder = FrameDecoder::new();
        for payload in buf.iter().filter_map(|&byte| decoder.feed(byte)) {
            let Some(message) = payload
                .ok()
                .and_then(|payload| ToSplitflap::decode(payload.as_slice()).ok())
            else {
                continue;
            };

            if self.auto_ack {
                let lost = self
                    .skipped_acks
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if lost {
                    continue;
                }
                let nonce = match self.wrong_acks {
                    true => message.nonce.wrapping_add(1),
                    false => message.nonce,
                };
                self.push_message(from_splitflap::Payload::Ack(Ack { nonce }));
            }

            if let (Some(state), Some(to_splitflap::Payload::RequestState(_))) =
                (&self.state_reply, &message.payload)
            {
                self.push_message(from_splitflap::Payload::SplitflapState(state.clone()));
            }
        }
    }
}

impl Display for MockTransportLayer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockTransportLayer")
    }
}

impl IoTransport for MockTransportLayer {
    fn open(&mut self) -> Result<(), Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error> {
        *self.timeout.lock() = Some(duration);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(ProtocolError::NotInitialized.into());
        }
        if self.failing_writes {
            return Err(ProtocolError::IoException {
                info: String::from("Mock write failure"),
            }
            .into());
        }
        self.outgoing.lock().extend_from_slice(buf);
        self.respond(buf);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.is_connected() {
            return Err(ProtocolError::NotInitialized.into());
        }
        let count = {
            let mut incoming = self.incoming.lock();
            let count = buf.len().min(incoming.len());
            for (slot, byte) in buf.iter_mut().zip(incoming.drain(..count)) {
                *slot = byte;
            }
            count
        };
        if count == 0 {
            // Simulates the read timeout of a real port.
            pause_sync!(5);
        }
        Ok(count)
    }
}
