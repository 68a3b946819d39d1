//! Outbound side of a client connection
//!
//! Sessions never write to a stream directly. Responses and broadcasts are
//! encoded and queued on a channel drained by the connection's writer
//! thread, so a slow reader never blocks the session that broadcasts to it.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::codec::{self, Response};
use crate::error::{Result, SyncError};

pub trait Socket: Send + Sync {
    fn id(&self) -> &str;

    fn send(&self, response: &Response) -> Result<()>;

    /// Stop accepting messages and ask the writer to hang up.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Switch the encoding of subsequent messages
    fn set_binary(&self, binary: bool);

    fn is_binary(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

pub struct ChannelSocket {
    id: String,
    tx: Sender<Outbound>,
    binary: AtomicBool,
    closed: AtomicBool,
}

impl ChannelSocket {
    pub fn new(id: &str) -> (Self, Receiver<Outbound>) {
        let (tx, rx) = unbounded();
        (
            Self {
                id: id.to_string(),
                tx,
                binary: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl Socket for ChannelSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, response: &Response) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::SessionNotActive);
        }
        let bytes = codec::encode_response(response, self.is_binary())?;
        self.tx
            .send(Outbound::Frame(bytes))
            .map_err(|_| SyncError::SessionNotActive)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_binary(&self, binary: bool) {
        self.binary.store(binary, Ordering::SeqCst);
    }

    fn is_binary(&self) -> bool {
        self.binary.load(Ordering::SeqCst)
    }
}

/// Decode every queued frame; stops at `Close` or when the queue is empty.
pub fn drain_responses(rx: &Receiver<Outbound>, binary: bool) -> Result<Vec<Response>> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Outbound::Frame(bytes) => out.push(codec::decode_response(&bytes, binary)?),
            Outbound::Close => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod socket_tests {
    use super::*;
    use crate::codec::ReqId;
    use serde_json::json;

    #[test]
    fn test_send_and_close() {
        let (socket, rx) = ChannelSocket::new("s1");
        socket.send(&Response::ok(Some(ReqId::Num(1)), json!("pong!"))).unwrap();
        socket.set_binary(true);
        socket.send(&Response::ok(Some(ReqId::Num(2)), json!(true))).unwrap();
        socket.close();
        socket.close();

        assert!(socket.send(&Response::default()).is_err());
        let frames: Vec<Outbound> = rx.try_iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Outbound::Close);

        // binary decode also accepts the text frame sent before the switch
        let responses = drain_responses(&{
            let (tx, rx) = unbounded();
            for f in frames {
                tx.send(f).unwrap();
            }
            rx
        }, true)
        .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].result, Some(json!(true)));
    }
}
