use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::codec::{Command, MessageId};
use crate::error::NsqError;

/// 8 (timestamp) + 2 (attempts) + 16 (id).
const MESSAGE_HEADER_LEN: usize = 26;

/// Write half of the connection a message arrived on.
#[derive(Debug, Clone)]
pub struct Responder {
    tx: mpsc::Sender<Command>,
}

impl Responder {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: Command) -> Result<(), NsqError> {
        self.tx.send(cmd).await.map_err(|_| NsqError::ConnectionClosed)
    }
}

/// A message delivered by nsqd.
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    /// Publish time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Bytes,
    /// Address of the nsqd connection that delivered the message.
    pub nsqd_address: String,
    responder: Responder,
    responded: AtomicBool,
}

impl Message {
    pub fn decode(
        mut data: Bytes,
        nsqd_address: &str,
        responder: Responder,
    ) -> Result<Self, NsqError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(NsqError::Protocol(format!(
                "message frame of {} bytes is shorter than its header",
                data.len()
            )));
        }

        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);

        Ok(Self {
            id: MessageId(id),
            timestamp,
            attempts,
            body: data,
            nsqd_address: nsqd_address.to_string(),
            responder,
            responded: AtomicBool::new(false),
        })
    }

    /// Mark the message processed. Later calls (and `requeue`) are no-ops.
    pub async fn finish(&self) -> Result<(), NsqError> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.responder.send(Command::Fin(self.id)).await
    }

    /// Hand the message back to nsqd for redelivery after `delay`.
    pub async fn requeue(&self, delay: Duration) -> Result<(), NsqError> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.responder.send(Command::Req { id: self.id, delay_ms }).await
    }

    /// Reset the nsqd-side timeout of an in-flight message.
    pub async fn touch(&self) -> Result<(), NsqError> {
        if self.is_responded() {
            return Ok(());
        }
        self.responder.send(Command::Touch(self.id)).await
    }

    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn frame_data(body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i64(1_700_000_000_000_000_000);
        buf.put_u16(3);
        buf.put_slice(b"0123456789abcdef");
        buf.put_slice(body);
        buf.freeze()
    }

    #[tokio::test]
    async fn decodes_header_and_body() {
        let (tx, _rx) = mpsc::channel(1);
        let msg = Message::decode(frame_data(b"hello"), "nsqd:4150", Responder::new(tx)).unwrap();

        assert_eq!(msg.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(msg.attempts, 3);
        assert_eq!(msg.id.to_string(), "0123456789abcdef");
        assert_eq!(&msg.body[..], b"hello");
        assert_eq!(msg.nsqd_address, "nsqd:4150");
    }

    #[tokio::test]
    async fn short_frame_is_a_protocol_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = Message::decode(Bytes::from_static(b"short"), "nsqd:4150", Responder::new(tx))
            .unwrap_err();
        assert!(matches!(err, NsqError::Protocol(_)));
    }

    #[tokio::test]
    async fn finish_is_sent_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let msg = Message::decode(frame_data(b""), "nsqd:4150", Responder::new(tx)).unwrap();

        msg.finish().await.unwrap();
        msg.finish().await.unwrap();
        msg.requeue(Duration::from_secs(1)).await.unwrap();

        assert_eq!(rx.recv().await, Some(Command::Fin(msg.id)));
        assert!(rx.try_recv().is_err());
        assert!(msg.is_responded());
    }

    #[tokio::test]
    async fn finish_on_closed_connection_errors() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let msg = Message::decode(frame_data(b""), "nsqd:4150", Responder::new(tx)).unwrap();
        assert!(matches!(msg.finish().await, Err(NsqError::ConnectionClosed)));
    }
}
