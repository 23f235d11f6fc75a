//! A scripted store node for exercising routing, redirection and reconnect
//! behavior without a live cluster. Test support only.

use futures::{SinkExt, StreamExt};
use resp::{codec::ValueCodec, Value};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// What the script decides to do with one received command.
pub enum MockReply {
    Reply(Value),
    /// Drop the connection without replying, as a failing node would.
    Hangup,
}

pub type Handler = Arc<dyn Fn(&[String]) -> MockReply + Send + Sync>;

/// One listening node. Every accepted connection runs the same handler;
/// received commands are logged for later assertions.
pub struct MockNode {
    addr: String,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    accept: tokio::task::JoinHandle<()>,
}

impl MockNode {
    pub async fn spawn(handler: Handler) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind an ephemeral port");
        let addr = listener
            .local_addr()
            .expect("listener has a local address")
            .to_string();
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let log = commands.clone();
        let accept = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(serve(stream, handler.clone(), log.clone()));
            }
        });

        MockNode {
            addr,
            commands,
            accept,
        }
    }

    /// `host:port` this node listens on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Every command received so far, as argument vectors.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// How many commands named `name` this node has received.
    pub fn count(&self, name: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(name))
            .count()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(stream: TcpStream, handler: Handler, log: Arc<Mutex<Vec<Vec<String>>>>) {
    let mut framed = Framed::new(stream, ValueCodec);
    while let Some(Ok(frame)) = framed.next().await {
        let args = decode_args(&frame);
        log.lock().unwrap().push(args.clone());
        match handler(&args) {
            MockReply::Reply(reply) => {
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
            MockReply::Hangup => return,
        }
    }
}

// Commands arrive as arrays of bulk strings; anything else logs as empty.
fn decode_args(frame: &Value) -> Vec<String> {
    frame
        .as_array()
        .unwrap_or(&[])
        .iter()
        .map(|arg| match arg.as_bulk() {
            Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Err(_) => String::new(),
        })
        .collect()
}

/// A healthy single-node script: no cluster support, version 6, empty
/// command table, every write acknowledged.
pub fn single_node_script() -> Handler {
    Arc::new(|args: &[String]| {
        let reply = match args.first().map(String::as_str) {
            Some("CLUSTER") => {
                Value::Error("ERR This instance has cluster support disabled".into())
            }
            Some("INFO") => Value::bulk(&b"redis_version:6.2.7\r\n"[..]),
            Some("COMMAND") => Value::Array(vec![Value::Array(vec![
                Value::bulk(&b"get"[..]),
                Value::Integer(2),
                Value::Array(vec![]),
                Value::Integer(1),
                Value::Integer(1),
                Value::Integer(1),
            ])]),
            Some("GET") => Value::Nil,
            Some("SET") | Some("HMSET") => Value::Simple("OK".into()),
            Some(_) => Value::Integer(1),
            None => Value::Error("ERR empty command".into()),
        };
        MockReply::Reply(reply)
    })
}
