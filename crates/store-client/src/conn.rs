use crate::StoreError;
use futures::{SinkExt, StreamExt};
use resp::{codec::ValueCodec, Frame, ProtocolError, Value};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

/// Handle on one node connection. Requests are multiplexed over a single
/// stream; replies arrive strictly in request order, so matching them up is
/// a FIFO queue inside the connection task.
#[derive(Clone)]
pub(crate) struct Connection {
    tx: mpsc::UnboundedSender<Request>,
}

struct Request {
    frame: Frame,
    reply: oneshot::Sender<Result<Value, StoreError>>,
}

impl Connection {
    /// Dial `addr` and spawn the connection task. `on_lost` runs once when
    /// the transport fails, after every in-flight request has been failed.
    pub(crate) async fn dial(
        addr: String,
        on_lost: impl FnOnce() + Send + 'static,
    ) -> Result<Connection, StoreError> {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| StoreError::Transport(format!("connect {}: {}", addr, err)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(addr, Framed::new(stream, ValueCodec), rx, on_lost));
        Ok(Connection { tx })
    }

    pub(crate) async fn request(&self, frame: Frame) -> Result<Value, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request { frame, reply: tx })
            .map_err(|_| StoreError::Disconnected)?;
        rx.await.map_err(|_| StoreError::Disconnected)?
    }
}

async fn run(
    addr: String,
    mut framed: Framed<TcpStream, ValueCodec>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    on_lost: impl FnOnce(),
) {
    let mut pending: VecDeque<oneshot::Sender<Result<Value, StoreError>>> = VecDeque::new();

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(Request { frame, reply }) => {
                    if let Err(err) = framed.send(frame).await {
                        let _ = reply.send(Err(classify(err, &addr)));
                        break;
                    }
                    pending.push_back(reply);
                }
                // All handles dropped; nothing further is owed.
                None => return,
            },
            reply = framed.next() => match reply {
                Some(Ok(value)) => match pending.pop_front() {
                    Some(tx) => {
                        let _ = tx.send(Ok(value));
                    }
                    None => tracing::warn!(%addr, "dropping unsolicited reply"),
                },
                Some(Err(err)) => {
                    tracing::warn!(%addr, error = %err, "closing connection on protocol error");
                    break;
                }
                None => {
                    tracing::debug!(%addr, "connection closed by peer");
                    break;
                }
            },
        }
    }

    for tx in pending {
        let _ = tx.send(Err(StoreError::Disconnected));
    }
    // Later senders fail at the channel; nothing reaches a dead task.
    rx.close();
    while let Ok(Request { reply, .. }) = rx.try_recv() {
        let _ = reply.send(Err(StoreError::Disconnected));
    }
    on_lost();
}

fn classify(err: ProtocolError, addr: &str) -> StoreError {
    match err {
        ProtocolError::Io(err) => StoreError::Transport(format!("{}: {}", addr, err)),
        other => StoreError::Protocol(other),
    }
}
