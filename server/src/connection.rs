//! Per-connection transport: framed writes plus a reader task that funnels
//! decoded frames into the session's single event channel.

use log::{debug, warn};
use shared::{encode_frame, FrameDecoder, Opcode};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ConnId = u32;

/// Network events delivered to the coordinating task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A complete inbound frame. The opcode byte is validated by the
    /// consumer so that the sender can be answered on garbage.
    Frame {
        conn: ConnId,
        opcode: u8,
        payload: String,
    },
    /// The connection hit EOF or a read error; no more frames will arrive.
    Dropped { conn: ConnId },
}

/// One participant's socket. The read half lives in a spawned task; the
/// write half stays here so that only the coordinator ever writes.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Splits the stream and starts the reader task.
    pub fn spawn(
        id: ConnId,
        stream: TcpStream,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> Self {
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(id, addr, read_half, events));
        Self {
            id,
            addr,
            writer,
            reader,
        }
    }

    /// Encodes and writes a single frame.
    pub async fn send<O: Opcode>(&mut self, opcode: O, parts: &[&str]) -> io::Result<()> {
        let frame = encode_frame(opcode, parts)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.writer.write_all(&frame).await
    }

    /// Flushes the write side shut. The reader task is stopped on drop.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    id: ConnId,
    addr: SocketAddr,
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok((opcode, payload)) => {
                            let event = NetEvent::Frame {
                                conn: id,
                                opcode,
                                payload,
                            };
                            if events.send(event).is_err() {
                                // Session is gone, nobody left to tell.
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping malformed frame from {}: {}", addr, e),
                    }
                }
            }
            Err(e) => {
                debug!("Read error on {}: {}", addr, e);
                break;
            }
        }
    }

    let _ = events.send(NetEvent::Dropped { conn: id });
}
