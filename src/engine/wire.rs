use byteorder::{ByteOrder, LittleEndian};

use super::{
    ast::AstNode,
    error::{DecodeError, EngineError},
    ClientId, Epoch, Name,
};

/// The first byte of every request. `Connect` and `Shutdown` are out-of-band:
/// nothing follows the kind byte. Every other kind is sequenced and carries a
/// [`Header`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect = 0,
    Disconnect = 1,
    Creation = 2,
    Deletion = 3,
    Operation = 4,
    Fetch = 5,
    Sync = 6,
    Shutdown = 7,
}

impl CommandKind {
    pub fn is_sequenced(self) -> bool {
        !matches!(self, CommandKind::Connect | CommandKind::Shutdown)
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CommandKind::Connect,
            1 => CommandKind::Disconnect,
            2 => CommandKind::Creation,
            3 => CommandKind::Deletion,
            4 => CommandKind::Operation,
            5 => CommandKind::Fetch,
            6 => CommandKind::Sync,
            7 => CommandKind::Shutdown,
            other => return Err(DecodeError::UnknownKind(other)),
        })
    }
}

/// Sequencing information of a command.
///
/// `kind | client_id | epoch | payload_len | payload`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: CommandKind,
    pub client: ClientId,
    pub epoch: Epoch,
    pub payload_len: u32,
}

/// A request split into its header and a borrowed payload.
#[derive(Debug, PartialEq)]
pub enum Frame<'a> {
    Connect,
    Shutdown,
    Command { header: Header, payload: &'a [u8] },
}

/// A bounds-checked cursor over a little-endian payload. Every read checks the
/// remaining length first and fails with [`DecodeError::Truncated`] instead of
/// reading past the end.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn take(
        &mut self,
        len: usize,
        field: &'static str,
    ) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < len {
            return Err(DecodeError::Truncated {
                field,
                needed: len,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other, field)),
        }
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.take(4, field)?))
    }

    pub fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        Ok(LittleEndian::read_u64(self.take(8, field)?))
    }

    pub fn f64(&mut self, field: &'static str) -> Result<f64, DecodeError> {
        Ok(LittleEndian::read_f64(self.take(8, field)?))
    }

    pub fn name(&mut self, field: &'static str) -> Result<Name, DecodeError> {
        self.u64(field).map(Name)
    }

    /// Reads `count` consecutive u64 values. The byte length is checked before
    /// anything is allocated.
    pub fn u64s(
        &mut self,
        count: usize,
        field: &'static str,
    ) -> Result<Vec<u64>, DecodeError> {
        let len = count.checked_mul(8).ok_or(DecodeError::SizeOverflow(field))?;
        let bytes = self.take(len, field)?;
        Ok(bytes.chunks_exact(8).map(LittleEndian::read_u64).collect())
    }

    /// Fails if anything is left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

/// Splits a raw request into its frame. The payload must be exactly as long
/// as the header declares.
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, DecodeError> {
    let mut reader = Reader::new(buf);
    let kind = CommandKind::try_from(reader.u8("kind")?)?;
    match kind {
        CommandKind::Connect => {
            reader.finish()?;
            Ok(Frame::Connect)
        }
        CommandKind::Shutdown => {
            reader.finish()?;
            Ok(Frame::Shutdown)
        }
        kind => {
            let header = decode_header(kind, &mut reader)?;
            let payload = reader.take(header.payload_len as usize, "payload")?;
            reader.finish()?;
            Ok(Frame::Command { header, payload })
        }
    }
}

pub fn decode_header(
    kind: CommandKind,
    reader: &mut Reader<'_>,
) -> Result<Header, DecodeError> {
    Ok(Header {
        kind,
        client: reader.u8("client id")?,
        epoch: reader.u64("epoch")?,
        payload_len: reader.u32("payload length")?,
    })
}

/// How a new array gets its initial contents.
#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    /// Row-major values, one per element.
    Buffer(Vec<f64>),
    Fill(f64),
    Random,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Creation {
    pub name: Name,
    pub dims: Vec<u64>,
    pub init: Initializer,
}

impl Creation {
    /// Number of elements described by `dims`, if it fits in a u64.
    pub fn element_count(&self) -> Option<u64> {
        self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 + 2 + 8 * self.dims.len());
        buf.extend_from_slice(&self.name.0.to_le_bytes());
        buf.extend_from_slice(&(self.dims.len() as u32).to_le_bytes());
        buf.push(matches!(self.init, Initializer::Buffer(_)) as u8);
        buf.push(matches!(self.init, Initializer::Fill(_)) as u8);
        for dim in &self.dims {
            buf.extend_from_slice(&dim.to_le_bytes());
        }
        match &self.init {
            Initializer::Buffer(values) => {
                for value in values {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
            Initializer::Fill(value) => {
                buf.extend_from_slice(&value.to_le_bytes())
            }
            Initializer::Random => {}
        }
        buf
    }
}

/// `result_name | ndim | has_buffer | has_init | dims | init_value or buffer`
pub fn decode_creation(reader: &mut Reader<'_>) -> Result<Creation, DecodeError> {
    let name = reader.name("result name")?;
    let ndim = reader.u32("ndim")?;
    let has_buffer = reader.bool("has_buffer")?;
    let has_init = reader.bool("has_init")?;
    let dims = reader.u64s(ndim as usize, "dims")?;

    let init = if has_buffer {
        let count = dims
            .iter()
            .try_fold(1usize, |acc, &d| {
                usize::try_from(d).ok().and_then(|d| acc.checked_mul(d))
            })
            .and_then(|count| count.checked_mul(8))
            .ok_or(DecodeError::SizeOverflow("init buffer"))?;
        let bytes = reader.take(count, "init buffer")?;
        Initializer::Buffer(
            bytes.chunks_exact(8).map(LittleEndian::read_f64).collect(),
        )
    } else if has_init {
        Initializer::Fill(reader.f64("init value")?)
    } else {
        Initializer::Random
    };

    Ok(Creation { name, dims, init })
}

/// `count:u32 | name:u64 * count`
pub fn decode_deletion_list(
    reader: &mut Reader<'_>,
) -> Result<Vec<Name>, DecodeError> {
    let count = reader.u32("deletion count")?;
    Ok(reader
        .u64s(count as usize, "deleted names")?
        .into_iter()
        .map(Name)
        .collect())
}

pub fn encode_deletion_list(names: &[Name], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        buf.extend_from_slice(&name.0.to_le_bytes());
    }
}

/// `num_deletions:u32 | name:u64 * n | tree`
pub fn encode_operation(deletions: &[Name], tree: &AstNode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 8 * deletions.len() + 64);
    encode_deletion_list(deletions, &mut buf);
    tree.encode(&mut buf);
    buf
}

pub fn decode_fetch_target(reader: &mut Reader<'_>) -> Result<Name, DecodeError> {
    reader.name("fetch target")
}

/// Wraps a sequenced payload into a full request.
pub fn encode_command(
    kind: CommandKind,
    client: ClientId,
    epoch: Epoch,
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(kind.is_sequenced());
    let mut buf = Vec::with_capacity(1 + 1 + 8 + 4 + payload.len());
    buf.push(kind as u8);
    buf.push(client);
    buf.extend_from_slice(&epoch.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_out_of_band(kind: CommandKind) -> Vec<u8> {
    debug_assert!(!kind.is_sequenced());
    vec![kind as u8]
}

/// Name and shape of an array installed by a `store` node. Scalars have no
/// dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResult {
    pub name: Name,
    pub dims: Vec<u64>,
}

/// The outcome of one command, as sent back to the client that issued it.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Connected(ClientId),
    Created,
    Deleted,
    Evaluated(Vec<StoredResult>),
    Value(f64),
    Synced,
    Disconnected,
    ShuttingDown,
    Failed(EngineError),
}

impl Reply {
    /// `status:u8 | body`. Status 0 is success, anything else is
    /// [`EngineError::code`] followed by a length-prefixed message.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8];
        match self {
            Reply::Connected(id) => buf.push(*id),
            Reply::Created | Reply::Synced => buf.push(1),
            Reply::Deleted | Reply::Disconnected | Reply::ShuttingDown => {}
            Reply::Evaluated(results) => {
                buf.extend_from_slice(&(results.len() as u32).to_le_bytes());
                for result in results {
                    buf.extend_from_slice(&result.name.0.to_le_bytes());
                    buf.push(result.dims.len() as u8);
                    for dim in &result.dims {
                        buf.extend_from_slice(&dim.to_le_bytes());
                    }
                }
            }
            Reply::Value(value) => buf.extend_from_slice(&value.to_le_bytes()),
            Reply::Failed(error) => {
                buf[0] = error.code();
                let msg = error.to_string();
                buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
                buf.extend_from_slice(msg.as_bytes());
            }
        }
        buf
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Failed(_))
    }
}

/// A reply with its status byte checked.
#[derive(Debug)]
pub enum ReplyBody<'a> {
    Ok(Reader<'a>),
    Err { code: u8, message: String },
}

pub fn decode_reply(buf: &[u8]) -> Result<ReplyBody<'_>, DecodeError> {
    let mut reader = Reader::new(buf);
    match reader.u8("status")? {
        0 => Ok(ReplyBody::Ok(reader)),
        code => {
            let len = reader.u32("error length")?;
            let bytes = reader.take(len as usize, "error message")?;
            Ok(ReplyBody::Err {
                code,
                message: String::from_utf8_lossy(bytes).into_owned(),
            })
        }
    }
}

pub fn decode_stored_results(
    reader: &mut Reader<'_>,
) -> Result<Vec<StoredResult>, DecodeError> {
    let count = reader.u32("result count")?;
    // each entry is at least a name and a dimension count
    if (count as usize).saturating_mul(9) > reader.remaining() {
        return Err(DecodeError::Truncated {
            field: "stored results",
            needed: (count as usize).saturating_mul(9),
            remaining: reader.remaining(),
        });
    }
    let mut results = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = reader.name("result name")?;
        let ndim = reader.u8("result ndim")?;
        let dims = reader.u64s(ndim as usize, "result dims")?;
        results.push(StoredResult { name, dims });
    }
    Ok(results)
}
