use crate::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded store reply.
///
/// Replies are dynamically typed on the wire; this is the tagged variant
/// every decoder validates before accessing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `+OK\r\n` status line.
    Simple(String),
    /// `-ERR ...\r\n` error line.
    Error(String),
    /// `:1\r\n` signed integer.
    Integer(i64),
    /// `$n\r\n...\r\n` binary-safe bulk string.
    Bulk(Bytes),
    /// `*n\r\n...` array of nested replies.
    Array(Vec<Value>),
    /// `$-1\r\n` or `*-1\r\n` nil.
    Nil,
}

impl Value {
    pub fn bulk(bytes: impl Into<Bytes>) -> Value {
        Value::Bulk(bytes.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Simple(_) => "status",
            Value::Error(_) => "error",
            Value::Integer(_) => "integer",
            Value::Bulk(_) => "string",
            Value::Array(_) => "array",
            Value::Nil => "nil",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// True for the `+OK` status reply.
    pub fn is_ok_status(&self) -> bool {
        matches!(self, Value::Simple(status) if status == "OK")
    }

    /// True for an error reply whose text contains `needle`.
    pub fn error_contains(&self, needle: &str) -> bool {
        matches!(self, Value::Error(text) if text.contains(needle))
    }

    /// The stream-insert error for an id at or below the current top entry.
    /// Such samples are dropped with a warning rather than failing the load.
    pub fn is_stream_dup(&self) -> bool {
        self.error_contains("equal or smaller than the target stream top item")
    }

    /// The reply a non-clustered server gives to cluster commands.
    pub fn is_nocluster(&self) -> bool {
        self.error_contains("cluster support disabled")
    }

    pub fn as_integer(&self) -> Result<i64, ProtocolError> {
        match self {
            Value::Integer(n) => Ok(*n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn as_bulk(&self) -> Result<&Bytes, ProtocolError> {
        match self {
            Value::Bulk(bytes) => Ok(bytes),
            other => Err(other.unexpected("string")),
        }
    }

    /// The UTF-8 text of a status or bulk reply.
    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        match self {
            Value::Simple(text) => Ok(text),
            Value::Bulk(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| ProtocolError::Utf8("string"))
            }
            other => Err(other.unexpected("string")),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], ProtocolError> {
        match self {
            Value::Array(elements) => Ok(elements),
            other => Err(other.unexpected("array")),
        }
    }

    /// An array reply with at least `arity` elements.
    pub fn elements(&self, arity: usize) -> Result<&[Value], ProtocolError> {
        let elements = self.as_array()?;
        if elements.len() < arity {
            return Err(ProtocolError::Arity {
                expected: arity,
                got: elements.len(),
            });
        }
        Ok(elements)
    }

    fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedKind {
            expected,
            got: self.kind(),
        }
    }

    /// Serialize back into wire form. The inverse of [`read`], used when a
    /// reply must be forwarded verbatim (and by scripted test servers).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Simple(text) => {
                buf.put_u8(b'+');
                buf.put_slice(text.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Value::Error(text) => {
                buf.put_u8(b'-');
                buf.put_slice(text.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Value::Integer(n) => {
                buf.put_slice(format!(":{}\r\n", n).as_bytes());
            }
            Value::Bulk(bytes) => {
                buf.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
                buf.put_slice(bytes);
                buf.put_slice(b"\r\n");
            }
            Value::Array(elements) => {
                buf.put_slice(format!("*{}\r\n", elements.len()).as_bytes());
                for element in elements {
                    element.encode(buf);
                }
            }
            Value::Nil => buf.put_slice(b"$-1\r\n"),
        }
    }
}

/// A cluster redirection reply: `MOVED slot host:port` or `ASK slot host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// An ASK redirect is one-shot and must not update the slot map.
    pub ask: bool,
    pub slot: u16,
    pub addr: String,
}

impl Redirect {
    pub fn parse(reply: &Value) -> Option<Redirect> {
        let text = match reply {
            Value::Error(text) => text,
            _ => return None,
        };
        let mut words = text.split_ascii_whitespace();
        let ask = match words.next() {
            Some("MOVED") => false,
            Some("ASK") => true,
            _ => return None,
        };
        let slot = words.next()?.parse().ok()?;
        let addr = words.next()?;
        if words.next().is_some() {
            return None;
        }
        Some(Redirect {
            ask,
            slot,
            addr: addr.to_owned(),
        })
    }
}

/// Decode one value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer holds only a prefix of a value.
pub fn read(buf: &[u8]) -> Result<Option<(Value, usize)>, ProtocolError> {
    let mut pos = 0;
    match read_at(buf, &mut pos)? {
        Some(value) => Ok(Some((value, pos))),
        None => Ok(None),
    }
}

fn read_at(buf: &[u8], pos: &mut usize) -> Result<Option<Value>, ProtocolError> {
    let marker = match buf.get(*pos) {
        Some(marker) => *marker,
        None => return Ok(None),
    };
    let line = match read_line(buf, *pos + 1) {
        Some(line) => line,
        None => return Ok(None),
    };
    let after_line = *pos + 1 + line.len() + 2;

    match marker {
        b'+' => {
            let text = line_utf8(line, "status")?;
            *pos = after_line;
            Ok(Some(Value::Simple(text.to_owned())))
        }
        b'-' => {
            let text = line_utf8(line, "error")?;
            *pos = after_line;
            Ok(Some(Value::Error(text.to_owned())))
        }
        b':' => {
            let n = line_integer(line, "integer")?;
            *pos = after_line;
            Ok(Some(Value::Integer(n)))
        }
        b'$' => {
            let len = line_integer(line, "string")?;
            if len == -1 {
                *pos = after_line;
                return Ok(Some(Value::Nil));
            }
            if len < 0 || len > i32::MAX as i64 {
                return Err(ProtocolError::BadLength("string", len));
            }
            let len = len as usize;
            if buf.len() < after_line + len + 2 {
                return Ok(None);
            }
            let payload = &buf[after_line..after_line + len];
            if &buf[after_line + len..after_line + len + 2] != b"\r\n" {
                return Err(ProtocolError::BadHeader("string"));
            }
            *pos = after_line + len + 2;
            Ok(Some(Value::Bulk(Bytes::copy_from_slice(payload))))
        }
        b'*' => {
            let count = line_integer(line, "array")?;
            if count == -1 {
                *pos = after_line;
                return Ok(Some(Value::Nil));
            }
            if count < 0 || count > i32::MAX as i64 {
                return Err(ProtocolError::BadLength("array", count));
            }
            let mut cursor = after_line;
            let mut elements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match read_at(buf, &mut cursor)? {
                    Some(element) => elements.push(element),
                    None => return Ok(None),
                }
            }
            *pos = cursor;
            Ok(Some(Value::Array(elements)))
        }
        other => Err(ProtocolError::BadMarker(other)),
    }
}

/// The bytes between `start` and the next CRLF, if a full line is buffered.
fn read_line(buf: &[u8], start: usize) -> Option<&[u8]> {
    let rest = buf.get(start..)?;
    let nl = memchr::memmem::find(rest, b"\r\n")?;
    Some(&rest[..nl])
}

fn line_utf8<'b>(line: &'b [u8], kind: &'static str) -> Result<&'b str, ProtocolError> {
    std::str::from_utf8(line).map_err(|_| ProtocolError::Utf8(kind))
}

fn line_integer(line: &[u8], kind: &'static str) -> Result<i64, ProtocolError> {
    line_utf8(line, kind)?
        .parse()
        .map_err(|_| ProtocolError::BadHeader(kind))
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(wire: &[u8]) -> (Value, usize) {
        read(wire).unwrap().expect("complete value")
    }

    #[test]
    fn test_scalar_replies() {
        assert_eq!(decode(b"+OK\r\n"), (Value::Simple("OK".into()), 5));
        assert_eq!(
            decode(b"-ERR bad wire\r\n"),
            (Value::Error("ERR bad wire".into()), 15)
        );
        assert_eq!(decode(b":42\r\n"), (Value::Integer(42), 5));
        assert_eq!(decode(b":-7\r\n"), (Value::Integer(-7), 5));
        assert_eq!(decode(b"$-1\r\n"), (Value::Nil, 5));
        assert_eq!(decode(b"$5\r\nhello\r\n"), (Value::bulk(&b"hello"[..]), 11));
        assert_eq!(decode(b"$0\r\n\r\n"), (Value::bulk(&b""[..]), 6));
    }

    #[test]
    fn test_binary_bulk() {
        let wire = b"$4\r\n\x00\xff\r\n\r\n";
        assert_eq!(decode(wire), (Value::bulk(&b"\x00\xff\r\n"[..]), 10));
    }

    #[test]
    fn test_nested_array() {
        let (value, used) = decode(b"*2\r\n:1\r\n*2\r\n+OK\r\n$1\r\nx\r\n");
        assert_eq!(used, 24);
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Integer(1),
                Value::Array(vec![Value::Simple("OK".into()), Value::bulk(&b"x"[..])]),
            ])
        );
    }

    #[test]
    fn test_partial_input() {
        for wire in [
            &b""[..],
            b"$",
            b"$5\r\nhel",
            b"*2\r\n:1\r\n",
            b"*2\r\n:1\r\n$3\r\nab",
            b"+OK",
        ] {
            assert!(matches!(read(wire), Ok(None)), "wire: {:?}", wire);
        }
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            read(b"@5\r\n"),
            Err(ProtocolError::BadMarker(b'@'))
        ));
        assert!(matches!(
            read(b"$x\r\n"),
            Err(ProtocolError::BadHeader("string"))
        ));
        assert!(matches!(
            read(b"$-2\r\n"),
            Err(ProtocolError::BadLength("string", -2))
        ));
    }

    #[test]
    fn test_encode_round_trip() {
        let value = Value::Array(vec![
            Value::Simple("OK".into()),
            Value::Error("ERR nope".into()),
            Value::Integer(-3),
            Value::bulk(&b"payload"[..]),
            Value::Nil,
        ]);
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        assert_eq!(decode(&buf).0, value);
    }

    #[test]
    fn test_redirect_parse() {
        let moved = Value::Error("MOVED 3456 127.0.0.1:6380".into());
        assert_eq!(
            Redirect::parse(&moved),
            Some(Redirect {
                ask: false,
                slot: 3456,
                addr: "127.0.0.1:6380".into(),
            })
        );

        let ask = Value::Error("ASK 12 10.0.0.9:7000".into());
        assert_eq!(
            Redirect::parse(&ask),
            Some(Redirect {
                ask: true,
                slot: 12,
                addr: "10.0.0.9:7000".into(),
            })
        );

        assert_eq!(Redirect::parse(&Value::Error("ERR MOVED on".into())), None);
        assert_eq!(Redirect::parse(&Value::Error("MOVED 99".into())), None);
        assert_eq!(Redirect::parse(&Value::Simple("MOVED 1 a:1".into())), None);
    }

    #[test]
    fn test_error_classes() {
        let dup = Value::Error(
            "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                .into(),
        );
        assert!(dup.is_stream_dup());
        assert!(!dup.is_nocluster());

        let single = Value::Error("ERR This instance has cluster support disabled".into());
        assert!(single.is_nocluster());
        assert!(!single.is_stream_dup());
    }

    #[test]
    fn test_accessors_validate_kind() {
        assert!(Value::Integer(1).as_integer().is_ok());
        assert!(Value::Nil.as_integer().is_err());
        assert!(Value::bulk(&b"a"[..]).as_str().is_ok());
        assert!(Value::Simple("OK".into()).as_str().is_ok());
        assert!(Value::Integer(1).as_str().is_err());

        let array = Value::Array(vec![Value::Integer(1), Value::Integer(2)]);
        assert!(array.elements(2).is_ok());
        assert!(matches!(
            array.elements(3),
            Err(ProtocolError::Arity {
                expected: 3,
                got: 2
            })
        ));
    }
}
