use super::*;

/// First byte of every binary frame. Anything else on the upstream socket is
/// the start of a JSON line.
pub const EX_MAGIC: u8 = 0x7f;

pub mod cmd {
    pub const REGISTER_WORKER: u8 = 0x01;
    pub const SUBMIT_SHARE: u8 = 0x02;
    pub const SUBMIT_SHARE_WITH_TIME: u8 = 0x03;
    pub const UNREGISTER_WORKER: u8 = 0x04;
    pub const MINING_SET_DIFF: u8 = 0x05;
    pub const SUBMIT_RESPONSE: u8 = 0x10;
    pub const SUBMIT_SHARE_WITH_VER: u8 = 0x12;
    pub const SUBMIT_SHARE_WITH_TIME_VER: u8 = 0x13;
    pub const GET_NONCE_PREFIX: u8 = 0x21;
    pub const SET_EXTRA_NONCE: u8 = 0x22;
}

/// A raw ex-message frame: `{u8 magic, u8 type, u16 len (LE, including the
/// 4-byte header), u8 body[len - 4]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExMessage {
    pub cmd: u8,
    pub body: Vec<u8>,
}

impl ExMessage {
    pub fn new(cmd: u8, body: Vec<u8>) -> Self {
        Self { cmd, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 4);
        out.push(EX_MAGIC);
        out.push(self.cmd);
        out.write_u16::<LittleEndian>((self.body.len() + 4) as u16)
            .expect("writing to a Vec is infallible");
        out.extend_from_slice(&self.body);
        out
    }
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let got = remaining(cursor);
    cursor.read_u8().map_err(|_| ProtocolError::Truncated {
        needed: 1,
        got,
    })
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, ProtocolError> {
    let got = remaining(cursor);
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ProtocolError::Truncated { needed: 2, got })
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, ProtocolError> {
    let got = remaining(cursor);
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ProtocolError::Truncated { needed: 4, got })
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, ProtocolError> {
    let got = remaining(cursor);
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::Truncated { needed: 8, got })
}

fn read_cstr(cursor: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let start = cursor.position() as usize;
    let bytes = cursor.get_ref();

    let end = bytes[start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or(ProtocolError::UnterminatedString)?;

    let s = str::from_utf8(&bytes[start..start + end])
        .map_err(|_| ProtocolError::NonUtf8String)?
        .to_string();

    cursor.set_position((start + end + 1) as u64);
    Ok(s)
}

fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// `CMD_REGISTER_WORKER`: announces a newly bound miner to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWorker {
    pub session_id: u16,
    pub client_agent: String,
    pub worker_name: String,
}

impl RegisterWorker {
    pub fn message(&self) -> ExMessage {
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(self.session_id)
            .expect("writing to a Vec is infallible");
        write_cstr(&mut body, &self.client_agent);
        write_cstr(&mut body, &self.worker_name);
        ExMessage::new(cmd::REGISTER_WORKER, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);
        Ok(Self {
            session_id: read_u16(&mut cursor)?,
            client_agent: read_cstr(&mut cursor)?,
            worker_name: read_cstr(&mut cursor)?,
        })
    }
}

/// `CMD_UNREGISTER_WORKER`: the miner with this session id went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterWorker {
    pub session_id: u16,
}

impl UnregisterWorker {
    pub fn message(&self) -> ExMessage {
        ExMessage::new(cmd::UNREGISTER_WORKER, self.session_id.to_le_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);
        Ok(Self {
            session_id: read_u16(&mut cursor)?,
        })
    }
}

/// Bitcoin share. The wire type depends on which optional fields are set:
/// a zero `time` or `version_mask` is omitted from the frame entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitShare {
    pub job_id: u8,
    pub session_id: u16,
    pub extra_nonce2: u32,
    pub nonce: u32,
    pub time: u32,
    pub version_mask: u32,
}

impl SubmitShare {
    pub fn cmd(&self) -> u8 {
        match (self.time != 0, self.version_mask != 0) {
            (false, false) => cmd::SUBMIT_SHARE,
            (true, false) => cmd::SUBMIT_SHARE_WITH_TIME,
            (false, true) => cmd::SUBMIT_SHARE_WITH_VER,
            (true, true) => cmd::SUBMIT_SHARE_WITH_TIME_VER,
        }
    }

    pub fn message(&self) -> ExMessage {
        let mut body = Vec::with_capacity(19);
        body.push(self.job_id);
        body.write_u16::<LittleEndian>(self.session_id)
            .expect("writing to a Vec is infallible");
        body.write_u32::<LittleEndian>(self.extra_nonce2)
            .expect("writing to a Vec is infallible");
        body.write_u32::<LittleEndian>(self.nonce)
            .expect("writing to a Vec is infallible");

        if self.time != 0 {
            body.write_u32::<LittleEndian>(self.time)
                .expect("writing to a Vec is infallible");
        }
        if self.version_mask != 0 {
            body.write_u32::<LittleEndian>(self.version_mask)
                .expect("writing to a Vec is infallible");
        }

        ExMessage::new(self.cmd(), body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(cmd: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);

        let mut share = Self {
            job_id: read_u8(&mut cursor)?,
            session_id: read_u16(&mut cursor)?,
            extra_nonce2: read_u32(&mut cursor)?,
            nonce: read_u32(&mut cursor)?,
            ..Self::default()
        };

        if cmd == cmd::SUBMIT_SHARE_WITH_TIME || cmd == cmd::SUBMIT_SHARE_WITH_TIME_VER {
            share.time = read_u32(&mut cursor)?;
        }
        if cmd == cmd::SUBMIT_SHARE_WITH_VER || cmd == cmd::SUBMIT_SHARE_WITH_TIME_VER {
            share.version_mask = read_u32(&mut cursor)?;
        }

        Ok(share)
    }
}

/// Ethereum share. The pool job id is opaque bytes, so it travels
/// length-prefixed; the mix hash (little-endian) fills the rest of the body
/// and may be absent for dialects that do not send one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitShareEth {
    pub session_id: u16,
    pub job_id: Vec<u8>,
    pub nonce: u64,
    pub mix_hash: Vec<u8>,
}

impl SubmitShareEth {
    pub fn message(&self) -> ExMessage {
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(self.session_id)
            .expect("writing to a Vec is infallible");
        body.push(self.job_id.len() as u8);
        body.extend_from_slice(&self.job_id);
        body.write_u64::<LittleEndian>(self.nonce)
            .expect("writing to a Vec is infallible");
        body.extend_from_slice(&self.mix_hash);
        ExMessage::new(cmd::SUBMIT_SHARE, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);

        let session_id = read_u16(&mut cursor)?;
        let job_len = read_u8(&mut cursor)? as usize;

        let got = remaining(&cursor);
        if got < job_len {
            return Err(ProtocolError::Truncated {
                needed: job_len,
                got,
            });
        }
        let start = cursor.position() as usize;
        let job_id = body[start..start + job_len].to_vec();
        cursor.set_position((start + job_len) as u64);

        let nonce = read_u64(&mut cursor)?;
        let mix_hash = body[cursor.position() as usize..].to_vec();

        Ok(Self {
            session_id,
            job_id,
            nonce,
            mix_hash,
        })
    }
}

/// `CMD_MINING_SET_DIFF`: difficulty `1 << diff_exp` for the listed miners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningSetDiff {
    pub diff_exp: u8,
    pub session_ids: Vec<u16>,
}

impl MiningSetDiff {
    pub fn message(&self) -> ExMessage {
        let mut body = Vec::with_capacity(3 + self.session_ids.len() * 2);
        body.push(self.diff_exp);
        body.write_u16::<LittleEndian>(self.session_ids.len() as u16)
            .expect("writing to a Vec is infallible");
        for session_id in &self.session_ids {
            body.write_u16::<LittleEndian>(*session_id)
                .expect("writing to a Vec is infallible");
        }
        ExMessage::new(cmd::MINING_SET_DIFF, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);

        let diff_exp = read_u8(&mut cursor)?;
        let count = read_u16(&mut cursor)?;

        let mut session_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            session_ids.push(read_u16(&mut cursor)?);
        }

        Ok(Self {
            diff_exp,
            session_ids,
        })
    }
}

/// `CMD_SUBMIT_RESPONSE`: the pool's verdict on the submit with this index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitResponse {
    pub index: u16,
    pub status: ShareStatus,
}

impl SubmitResponse {
    pub fn message(&self) -> ExMessage {
        let mut body = Vec::with_capacity(6);
        body.write_u16::<LittleEndian>(self.index)
            .expect("writing to a Vec is infallible");
        body.write_u32::<LittleEndian>(self.status.0)
            .expect("writing to a Vec is infallible");
        ExMessage::new(cmd::SUBMIT_RESPONSE, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);
        Ok(Self {
            index: read_u16(&mut cursor)?,
            status: ShareStatus(read_u32(&mut cursor)?),
        })
    }
}

/// `CMD_GET_NONCE_PREFIX` (Ethereum): ask the pool for a miner's extra nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetNoncePrefix {
    pub session_id: u16,
}

impl GetNoncePrefix {
    pub fn message(&self) -> ExMessage {
        ExMessage::new(cmd::GET_NONCE_PREFIX, self.session_id.to_le_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);
        Ok(Self {
            session_id: read_u16(&mut cursor)?,
        })
    }
}

/// `CMD_SET_EXTRA_NONCE` (Ethereum): per-miner extra nonce allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetExtraNonce {
    pub session_id: u16,
    pub extra_nonce: u32,
}

impl SetExtraNonce {
    /// The pool is full and cannot take another miner.
    pub const POOL_FULL: u32 = 0xffffffff;

    pub fn message(&self) -> ExMessage {
        let mut body = Vec::with_capacity(6);
        body.write_u16::<LittleEndian>(self.session_id)
            .expect("writing to a Vec is infallible");
        body.write_u32::<LittleEndian>(self.extra_nonce)
            .expect("writing to a Vec is infallible");
        ExMessage::new(cmd::SET_EXTRA_NONCE, body)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(body);
        Ok(Self {
            session_id: read_u16(&mut cursor)?,
            extra_nonce: read_u32(&mut cursor)?,
        })
    }
}
