use std::io::{BufRead, BufReader, Read, Write};

use super::{Message, ProtocolError};

/// Serialize one frame, append the newline, flush.
///
/// Frame writes are atomic at the granularity of this function; callers that
/// share a writer guard it with a mutex.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads newline-terminated JSON frames off a byte stream.
///
/// Unparseable lines are logged at warn level and skipped; frames are
/// sequential and self-delimited, so a bad line never corrupts the next one.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Next frame. `Ok(None)` on clean EOF; `Err` on stream failure.
    pub fn read(&mut self) -> Result<Option<Message>, ProtocolError> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line)?;
            if bytes_read == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            match Message::parse(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!("discarding malformed frame: {e}");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let msg = Message::request("status").with("id", 4u64);
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read().unwrap(), Some(msg));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn malformed_line_is_skipped() {
        let bytes = b"not valid json\n{\"id\":1,\"do\":\"register\"}\n".to_vec();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let msg = reader.read().unwrap().unwrap();
        assert_eq!(msg.id(), Some(1));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let bytes = b"\n  \n{\"id\":2}\n".to_vec();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(reader.read().unwrap().unwrap().id(), Some(2));
    }
}
