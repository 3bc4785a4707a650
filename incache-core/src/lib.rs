//! incache Core - Types and Collaborator Contracts
//!
//! Validity tokens, cached entries, the fragment event model with its
//! compiled byte stream, and the traits through which the include cache talks
//! to source resolution and fragment fetching. No caching policy lives here.

pub mod config;
pub mod entry;
pub mod error;
pub mod fragment;
pub mod source;
pub mod validity;

pub use config::{parse_flag, IncludeCacheConfig};
pub use entry::CachedEntry;
pub use error::{
    CodecError, ConfigError, FetchError, IncludeError, IncludeResult, ProtocolError, SourceError,
    StorageError,
};
pub use fragment::{
    compile, decode, replay, Attribute, ByteStreamCompiler, CompiledFragmentLoader, EventConsumer,
    FragmentLoader, TeeConsumer, XmlEvent,
};
pub use source::{Source, SourceResolver};
pub use validity::{Validity, ValidityToken};
