//! Fixed-width on-disk encoding of the repository header and its records
//!
//! Every field is written at its full capacity with no length prefix or
//! delimiter, so the layout is purely positional. The entry count is kept
//! as decimal text, never as a native integer.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::error::{RepoError, Result};

pub const W_MAGIC: usize = 32;
pub const W_OWNER: usize = 32;
pub const W_LOGFILE: usize = 256;
pub const W_COUNT: usize = 32;

pub const W_DATABASE: usize = 64;
pub const W_SCHEMA: usize = 30;
pub const W_OSUSER: usize = 32;
pub const W_SECRET: usize = 30;

pub const HEADER_LEN: usize = W_MAGIC + W_OWNER + W_LOGFILE + W_COUNT;
pub const RECORD_LEN: usize = W_DATABASE + W_SCHEMA + W_OSUSER + W_SECRET;

/// Format tag at offset 0 of every repository file
pub const MAGIC: &[u8; W_MAGIC] = b"OraclePasswordRepository 1.1.0 \0";

/// Decoding failures, mapped to corrupt-repository by the store
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{0} truncated")]
    Truncated(&'static str),

    #[error("entry count {0:?} unreadable")]
    Count(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A fixed-capacity, zero-padded byte field.
///
/// Equality and ordering run over all `N` bytes, padding included, so two
/// fields that print the same but differ after the terminator are distinct.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedField<const N: usize>([u8; N]);

impl<const N: usize> FixedField<N> {
    pub const CAPACITY: usize = N;

    pub fn empty() -> Self {
        Self([0; N])
    }

    /// Build a field from text. At most `N - 1` bytes fit so a terminator
    /// always remains.
    pub fn from_text(field: &'static str, text: &str) -> Result<Self> {
        Self::from_bytes(field, text.as_bytes())
    }

    pub fn from_bytes(field: &'static str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > N - 1 {
            return Err(RepoError::FieldTooLong { field, max: N - 1 });
        }
        let mut raw = [0; N];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn from_raw(raw: [u8; N]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; N] {
        &mut self.0
    }

    /// Meaningful bytes: everything before the first zero, bounded by `N`.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        &self.0[..end]
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.trimmed())
    }

    pub fn is_blank(&self) -> bool {
        self.trimmed().is_empty()
    }

    fn read_from<R: Read>(
        reader: &mut R,
        name: &'static str,
    ) -> std::result::Result<Self, DecodeError> {
        let mut raw = [0; N];
        match reader.read_exact(&mut raw) {
            Ok(()) => Ok(Self(raw)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DecodeError::Truncated(name)),
            Err(e) => Err(DecodeError::Io(e)),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.0)
    }
}

impl<const N: usize> fmt::Debug for FixedField<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text())
    }
}

pub type DatabaseField = FixedField<W_DATABASE>;
pub type SchemaField = FixedField<W_SCHEMA>;
pub type OsUserField = FixedField<W_OSUSER>;

/// Repository header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: FixedField<W_MAGIC>,
    /// Principal that created the repository
    pub owner: FixedField<W_OWNER>,
    /// Audit log path, blank when logging is disabled
    pub logfile: FixedField<W_LOGFILE>,
    /// Number of records following the header
    pub count: usize,
}

impl Header {
    pub fn new(owner: &str) -> Result<Self> {
        Ok(Self {
            magic: FixedField::from_raw(*MAGIC),
            owner: FixedField::from_text("owner", owner)?,
            logfile: FixedField::empty(),
            count: 0,
        })
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic.as_bytes() == MAGIC
    }

    pub fn decode<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let magic = FixedField::read_from(reader, "magic")?;
        let owner = FixedField::read_from(reader, "owner")?;
        let logfile = FixedField::read_from(reader, "logfile")?;
        let count_field: FixedField<W_COUNT> = FixedField::read_from(reader, "entry count")?;

        Ok(Self {
            magic,
            owner,
            logfile,
            count: parse_count(&count_field)?,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let digits = self.count.to_string();
        let mut count_raw = [0; W_COUNT];
        count_raw[..digits.len()].copy_from_slice(digits.as_bytes());

        self.magic.write_to(writer)?;
        self.owner.write_to(writer)?;
        self.logfile.write_to(writer)?;
        writer.write_all(&count_raw)
    }
}

fn parse_count(field: &FixedField<W_COUNT>) -> std::result::Result<usize, DecodeError> {
    let digits = field.trimmed();
    if digits.is_empty() {
        return Ok(0);
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::Count(field.text().into_owned()));
    }
    field
        .text()
        .parse()
        .map_err(|_| DecodeError::Count(field.text().into_owned()))
}

/// One credential record. The secret is held obfuscated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub database: FixedField<W_DATABASE>,
    pub schema: FixedField<W_SCHEMA>,
    pub osuser: FixedField<W_OSUSER>,
    pub secret: FixedField<W_SECRET>,
}

impl Record {
    pub fn decode<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            database: FixedField::read_from(reader, "database")?,
            schema: FixedField::read_from(reader, "schemaname")?,
            osuser: FixedField::read_from(reader, "osusername")?,
            secret: FixedField::read_from(reader, "password")?,
        })
    }

    /// Decode the next record of a headerless stream, `None` at a clean end.
    pub fn decode_next<R: Read>(reader: &mut R) -> std::result::Result<Option<Self>, DecodeError> {
        let mut raw = [0u8; RECORD_LEN];
        let filled = fill(reader, &mut raw)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < RECORD_LEN {
            return Err(DecodeError::Truncated("entry"));
        }
        Self::decode(&mut &raw[..]).map(Some)
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.database.write_to(writer)?;
        self.schema.write_to(writer)?;
        self.osuser.write_to(writer)?;
        self.secret.write_to(writer)
    }
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
