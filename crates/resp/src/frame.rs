use bytes::{BufMut, Bytes, BytesMut};

/// A pre-encoded command, built argument by argument in wire form.
///
/// The dispatch layer treats frames as opaque bytes: they are encoded once
/// here and never re-parsed, and a frame re-issued after a redirection is a
/// cheap clone of the same buffer. The command word is kept aside for
/// diagnostics only.
#[derive(Clone)]
pub struct Frame {
    name: &'static str,
    argc: usize,
    args: usize,
    buf: BytesMut,
}

impl Frame {
    /// Start a command of exactly `argc` arguments (the command word counts).
    pub fn new(name: &'static str, argc: usize) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("*{}\r\n", argc).as_bytes());
        Frame {
            name,
            argc,
            args: 0,
            buf,
        }
        .arg(name)
    }

    /// Append one binary-safe argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Frame {
        let arg = arg.as_ref();
        self.args += 1;
        debug_assert!(
            self.args <= self.argc,
            "{}: more than {} arguments",
            self.name,
            self.argc
        );
        self.buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        self.buf.put_slice(arg);
        self.buf.put_slice(b"\r\n");
        self
    }

    /// The command word, for log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn into_bytes(self) -> Bytes {
        debug_assert!(
            self.args == self.argc,
            "{}: {} of {} arguments",
            self.name,
            self.args,
            self.argc
        );
        self.buf.freeze()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("name", &self.name)
            .field("argc", &self.argc)
            .field("len", &self.buf.len())
            .finish()
    }
}
