//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! The extractor walks the plaintext record/handshake/extension structure
//! of the first TLS record a client sends and recovers the host_name entry
//! of the server_name extension. It never decrypts anything and never
//! allocates beyond the returned hostname.
//!
//! The function is restartable: callers append bytes to a buffer as they
//! arrive and call [`extract_sni`] again until it returns something other
//! than [`Extraction::NeedMoreData`].
//!
//! TLS record structure:
//! - byte 0: content type (0x16 = Handshake)
//! - bytes 1-2: version
//! - bytes 3-4: record length
//! - bytes 5+: handshake message
//!
//! Handshake ClientHello:
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - bytes 4-5: client version
//! - bytes 6-37: random (32 bytes)
//! - 1 byte: session ID length, then session ID
//! - 2 bytes: cipher suites length, then cipher suites
//! - 1 byte: compression methods length, then compression methods
//! - 2 bytes: extensions length, then extensions

/// Length of the TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Record content type for handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type of a ClientHello.
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Largest plaintext record body a peer may send (2^14 bytes).
pub const MAX_PLAINTEXT_RECORD_LEN: usize = 16 * 1024;

const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Client version (2) + random (32).
const HELLO_FIXED_LEN: usize = 34;

/// The 5-byte header in front of every TLS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    /// Declared length of the record body.
    pub length: u16,
}

impl RecordHeader {
    /// Read the record header from the start of `buf`, if enough bytes exist.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let header = buf.get(..RECORD_HEADER_LEN)?;
        Some(Self {
            content_type: header[0],
            version: u16::from_be_bytes([header[1], header[2]]),
            length: u16::from_be_bytes([header[3], header[4]]),
        })
    }

    pub fn is_handshake(&self) -> bool {
        self.content_type == CONTENT_TYPE_HANDSHAKE
    }

    /// Total size of the record including its header.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length as usize
    }
}

/// Outcome of an extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The SNI host name, byte-exact as sent by the client.
    Found(String),
    /// The buffer ends before the answer is known; retry with more bytes.
    NeedMoreData,
    /// Not a ClientHello, malformed, or a ClientHello without SNI. More
    /// bytes will not change the answer.
    NoSni,
}

impl Extraction {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Extraction::Found(hostname) => Some(hostname),
            _ => None,
        }
    }
}

/// Extract the SNI hostname from the first TLS record in `buf`.
///
/// Every length-prefixed field is bounds-checked before it is skipped. A
/// field running past the end of `buf` yields `NeedMoreData` while the
/// declared record is still arriving; once the whole record is buffered the
/// same overflow means the record lies about its own layout and yields
/// `NoSni`. A record declaring an empty body carries no handshake bytes at
/// all and is still waiting for them.
pub fn extract_sni(buf: &[u8]) -> Extraction {
    let Some(header) = RecordHeader::parse(buf) else {
        return Extraction::NeedMoreData;
    };
    if !header.is_handshake() {
        return Extraction::NoSni;
    }

    let record_len = header.record_len();
    let overflow = if buf.len() < record_len || header.length == 0 {
        Halt::NeedMoreData
    } else {
        Halt::NoSni
    };
    let mut cursor = Cursor {
        buf,
        pos: RECORD_HEADER_LEN,
        limit: buf.len().min(record_len),
        overflow,
    };

    match client_hello_server_name(&mut cursor) {
        Ok(hostname) => Extraction::Found(hostname),
        Err(Halt::NeedMoreData) => Extraction::NeedMoreData,
        Err(Halt::NoSni) => Extraction::NoSni,
    }
}

fn client_hello_server_name(cursor: &mut Cursor<'_>) -> Result<String, Halt> {
    if cursor.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(Halt::NoSni);
    }
    // Handshake length. Bounds come from the record, not from this field.
    cursor.skip(3)?;
    cursor.skip(HELLO_FIXED_LEN)?;

    // session_id, cipher_suites, compression_methods
    cursor.u8_prefixed()?;
    cursor.u16_prefixed()?;
    cursor.u8_prefixed()?;

    let mut extensions = Cursor::within(cursor.u16_prefixed()?);
    while !extensions.is_exhausted() {
        let ext_type = extensions.u16()?;
        let data = extensions.u16_prefixed()?;
        if ext_type == EXT_SERVER_NAME {
            return server_name_list(data);
        }
    }

    Err(Halt::NoSni)
}

/// Parse the server_name extension body and return its first host_name.
fn server_name_list(data: &[u8]) -> Result<String, Halt> {
    let mut ext = Cursor::within(data);
    let mut list = Cursor::within(ext.u16_prefixed()?);

    while !list.is_exhausted() {
        let name_type = list.u8()?;
        let name = list.u16_prefixed()?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        if name.is_empty() {
            return Err(Halt::NoSni);
        }
        return std::str::from_utf8(name)
            .map(str::to_owned)
            .map_err(|_| Halt::NoSni);
    }

    Err(Halt::NoSni)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    NeedMoreData,
    NoSni,
}

/// Forward-only reader that refuses to move past `limit`.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
    /// What running past `limit` means for this cursor.
    overflow: Halt,
}

impl<'a> Cursor<'a> {
    /// A cursor over a slice that has already been bounds-checked as a
    /// whole; any overflow inside it is malformed.
    fn within(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
            overflow: Halt::NoSni,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.limit
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Halt> {
        let end = match self.pos.checked_add(n) {
            Some(end) if end <= self.limit => end,
            _ => return Err(self.overflow),
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<(), Halt> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, Halt> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Halt> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u8_prefixed(&mut self) -> Result<&'a [u8], Halt> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn u16_prefixed(&mut self) -> Result<&'a [u8], Halt> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
