//! Fragment event model and its compiled byte stream.
//!
//! Included content travels as a flat sequence of [`XmlEvent`]s pushed into an
//! [`EventConsumer`]. For caching, the sequence is compiled into a compact
//! byte stream by [`ByteStreamCompiler`] and played back with [`replay`].
//!
//! # Stream Format
//!
//! - Bytes 0-3: magic `CXML`
//! - Byte 4: format version (currently 1)
//! - Then one record per event: a tag byte followed by its string fields,
//!   each encoded as `[len: u32 LE][UTF-8 bytes]`. Attribute lists are
//!   prefixed with their count as `u32 LE`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, IncludeResult};
use crate::source::Source;

/// Stream magic.
pub const MAGIC: &[u8; 4] = b"CXML";

/// Current stream format version.
pub const VERSION: u8 = 1;

const TAG_START_DOCUMENT: u8 = 1;
const TAG_END_DOCUMENT: u8 = 2;
const TAG_START_PREFIX_MAPPING: u8 = 3;
const TAG_END_PREFIX_MAPPING: u8 = 4;
const TAG_START_ELEMENT: u8 = 5;
const TAG_END_ELEMENT: u8 = 6;
const TAG_CHARACTERS: u8 = 7;
const TAG_COMMENT: u8 = 8;
const TAG_PROCESSING_INSTRUCTION: u8 = 9;

/// A single element attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One structural event of an XML fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XmlEvent {
    StartDocument,
    EndDocument,
    StartPrefixMapping { prefix: String, uri: String },
    EndPrefixMapping { prefix: String },
    StartElement { name: String, attributes: Vec<Attribute> },
    EndElement { name: String },
    Characters(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

impl XmlEvent {
    pub fn start(name: impl Into<String>) -> Self {
        Self::StartElement {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn end(name: impl Into<String>) -> Self {
        Self::EndElement { name: name.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Characters(text.into())
    }
}

/// Receiver of fragment events.
pub trait EventConsumer: Send {
    fn consume(&mut self, event: &XmlEvent) -> IncludeResult<()>;
}

/// Collecting consumer, mostly useful in tests.
impl EventConsumer for Vec<XmlEvent> {
    fn consume(&mut self, event: &XmlEvent) -> IncludeResult<()> {
        self.push(event.clone());
        Ok(())
    }
}

/// Fans every event out to two consumers, first then second.
pub struct TeeConsumer<'a> {
    first: &'a mut dyn EventConsumer,
    second: &'a mut dyn EventConsumer,
}

impl<'a> TeeConsumer<'a> {
    pub fn new(first: &'a mut dyn EventConsumer, second: &'a mut dyn EventConsumer) -> Self {
        Self { first, second }
    }
}

impl EventConsumer for TeeConsumer<'_> {
    fn consume(&mut self, event: &XmlEvent) -> IncludeResult<()> {
        self.first.consume(event)?;
        self.second.consume(event)
    }
}

/// Compiles consumed events into the cacheable byte stream.
#[derive(Debug, Clone)]
pub struct ByteStreamCompiler {
    buffer: Vec<u8>,
}

impl Default for ByteStreamCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStreamCompiler {
    pub fn new() -> Self {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(MAGIC);
        buffer.push(VERSION);
        Self { buffer }
    }

    /// Finish compilation and take the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    fn write_str(&mut self, s: &str) {
        // Fragments larger than 4 GiB are not representable
        let len = u32::try_from(s.len()).unwrap_or(u32::MAX);
        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(&s.as_bytes()[..len as usize]);
    }
}

impl EventConsumer for ByteStreamCompiler {
    fn consume(&mut self, event: &XmlEvent) -> IncludeResult<()> {
        match event {
            XmlEvent::StartDocument => self.buffer.push(TAG_START_DOCUMENT),
            XmlEvent::EndDocument => self.buffer.push(TAG_END_DOCUMENT),
            XmlEvent::StartPrefixMapping { prefix, uri } => {
                self.buffer.push(TAG_START_PREFIX_MAPPING);
                self.write_str(prefix);
                self.write_str(uri);
            }
            XmlEvent::EndPrefixMapping { prefix } => {
                self.buffer.push(TAG_END_PREFIX_MAPPING);
                self.write_str(prefix);
            }
            XmlEvent::StartElement { name, attributes } => {
                self.buffer.push(TAG_START_ELEMENT);
                self.write_str(name);
                let count = u32::try_from(attributes.len()).unwrap_or(u32::MAX);
                self.buffer.extend_from_slice(&count.to_le_bytes());
                for attr in attributes.iter().take(count as usize) {
                    self.write_str(&attr.name);
                    self.write_str(&attr.value);
                }
            }
            XmlEvent::EndElement { name } => {
                self.buffer.push(TAG_END_ELEMENT);
                self.write_str(name);
            }
            XmlEvent::Characters(text) => {
                self.buffer.push(TAG_CHARACTERS);
                self.write_str(text);
            }
            XmlEvent::Comment(text) => {
                self.buffer.push(TAG_COMMENT);
                self.write_str(text);
            }
            XmlEvent::ProcessingInstruction { target, data } => {
                self.buffer.push(TAG_PROCESSING_INSTRUCTION);
                self.write_str(target);
                self.write_str(data);
            }
        }
        Ok(())
    }
}

/// Compile a complete event sequence.
pub fn compile<'a, I>(events: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a XmlEvent>,
{
    let mut compiler = ByteStreamCompiler::new();
    for event in events {
        // Compiling into memory cannot fail
        let _ = compiler.consume(event);
    }
    compiler.into_bytes()
}

/// Play a compiled byte stream into `consumer`.
///
/// Events decoded before a malformed record are delivered before the error
/// is returned.
pub fn replay(bytes: &[u8], consumer: &mut dyn EventConsumer) -> IncludeResult<()> {
    let mut reader = StreamReader::new(bytes)?;
    while let Some(event) = reader.next_event()? {
        consumer.consume(&event)?;
    }
    Ok(())
}

/// Decode a compiled byte stream into owned events.
pub fn decode(bytes: &[u8]) -> IncludeResult<Vec<XmlEvent>> {
    let mut events: Vec<XmlEvent> = Vec::new();
    replay(bytes, &mut events)?;
    Ok(events)
}

struct StreamReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> StreamReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < 5 || &bytes[0..4] != MAGIC {
            return Err(CodecError::BadHeader);
        }
        if bytes[4] != VERSION {
            return Err(CodecError::UnsupportedVersion(bytes[4]));
        }
        Ok(Self { bytes, offset: 5 })
    }

    fn next_event(&mut self) -> Result<Option<XmlEvent>, CodecError> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        let tag_offset = self.offset;
        let tag = self.bytes[self.offset];
        self.offset += 1;

        let event = match tag {
            TAG_START_DOCUMENT => XmlEvent::StartDocument,
            TAG_END_DOCUMENT => XmlEvent::EndDocument,
            TAG_START_PREFIX_MAPPING => XmlEvent::StartPrefixMapping {
                prefix: self.read_str()?,
                uri: self.read_str()?,
            },
            TAG_END_PREFIX_MAPPING => XmlEvent::EndPrefixMapping {
                prefix: self.read_str()?,
            },
            TAG_START_ELEMENT => {
                let name = self.read_str()?;
                let count = self.read_u32()? as usize;
                // Each attribute needs at least 8 bytes of length prefixes
                let remaining = self.bytes.len() - self.offset;
                if count > remaining / 8 {
                    return Err(CodecError::Truncated {
                        offset: self.offset,
                    });
                }
                let mut attributes = Vec::with_capacity(count);
                for _ in 0..count {
                    attributes.push(Attribute {
                        name: self.read_str()?,
                        value: self.read_str()?,
                    });
                }
                XmlEvent::StartElement { name, attributes }
            }
            TAG_END_ELEMENT => XmlEvent::EndElement {
                name: self.read_str()?,
            },
            TAG_CHARACTERS => XmlEvent::Characters(self.read_str()?),
            TAG_COMMENT => XmlEvent::Comment(self.read_str()?),
            TAG_PROCESSING_INSTRUCTION => XmlEvent::ProcessingInstruction {
                target: self.read_str()?,
                data: self.read_str()?,
            },
            tag => {
                return Err(CodecError::UnknownTag {
                    tag,
                    offset: tag_offset,
                })
            }
        };
        Ok(Some(event))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let end = self.offset + 4;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(CodecError::Truncated {
                offset: self.offset,
            })?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(slice);
        self.offset = end;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let start = self.offset;
        let slice = start
            .checked_add(len)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(CodecError::Truncated { offset: start })?;
        let s = std::str::from_utf8(slice).map_err(|_| CodecError::InvalidUtf8 { offset: start })?;
        self.offset = start + len;
        Ok(s.to_string())
    }
}

/// Fetch-and-emit collaborator: pushes a resource's content as events.
#[async_trait]
pub trait FragmentLoader: Send + Sync {
    async fn emit(
        &self,
        source: &dyn Source,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()>;
}

/// Loader for sources whose content is already a compiled byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompiledFragmentLoader;

#[async_trait]
impl FragmentLoader for CompiledFragmentLoader {
    async fn emit(
        &self,
        source: &dyn Source,
        consumer: &mut dyn EventConsumer,
    ) -> IncludeResult<()> {
        let bytes = source.read().await?;
        tracing::trace!(
            uri = %source.uri(),
            bytes = bytes.len(),
            "Replaying compiled fragment"
        );
        replay(&bytes, consumer).map_err(|e| match e {
            crate::IncludeError::Codec(codec) => crate::error::FetchError::Malformed {
                uri: source.uri().to_string(),
                reason: codec.to_string(),
            }
            .into(),
            other => other,
        })
    }
}
