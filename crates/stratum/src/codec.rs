use super::*;

/// One frame off the upstream socket: pools interleave newline-delimited JSON
/// lines with binary ex-messages on the same connection, discriminated by the
/// first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Json(String),
    Ex(ExMessage),
}

#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(context(false))]
    Io { source: io::Error },

    #[snafu(display("broken ex-message header, length {len} includes no body"))]
    BrokenFrame { len: u16 },

    #[snafu(display("line exceeds {MAX_MESSAGE_SIZE} bytes without a newline"))]
    OversizedLine { len: usize },
}

/// Codec for the agent↔pool connection. JSON lines are emitted verbatim (sans
/// terminator); ex-messages are framed by their length header.
#[derive(Debug, Default)]
pub struct AgentCodec;

impl Decoder for AgentCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(first) = src.first() else {
            return Ok(None);
        };

        if *first == EX_MAGIC {
            if src.len() < 4 {
                return Ok(None);
            }

            let len = u16::from_le_bytes([src[2], src[3]]);
            if len < 4 {
                return Err(CodecError::BrokenFrame { len });
            }

            let len = len as usize;
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            let frame = src.split_to(len);
            return Ok(Some(Frame::Ex(ExMessage::new(
                frame[1],
                frame[4..].to_vec(),
            ))));
        }

        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                let mut line = &line[..pos];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                Ok(Some(Frame::Json(
                    String::from_utf8_lossy(line).into_owned(),
                )))
            }
            None if src.len() > MAX_MESSAGE_SIZE => {
                Err(CodecError::OversizedLine { len: src.len() })
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for AgentCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        match frame {
            Frame::Json(line) => {
                dst.extend_from_slice(line.as_bytes());
                if !line.ends_with('\n') {
                    dst.extend_from_slice(b"\n");
                }
            }
            Frame::Ex(message) => dst.extend_from_slice(&message.encode()),
        }
        Ok(())
    }
}
