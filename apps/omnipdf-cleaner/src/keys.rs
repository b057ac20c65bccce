//! Prefix-tagged key protocol
//!
//! Every key this service writes (or asks the cleaner to watch) has the form
//! `TAG:identifier`. The tag names the resource class so that a single flat
//! stream of keyspace notifications can be routed to the right cleanup
//! handler. Keys with no separator, more than one separator, an empty tag or
//! an empty identifier are malformed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between tag and identifier
pub const SEPARATOR: char = ':';

/// Malformed tagged key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key {0:?} has no tag separator")]
    MissingSeparator(String),

    #[error("key {0:?} contains more than one tag separator")]
    ExtraSeparator(String),

    #[error("key {0:?} has an empty tag")]
    EmptyTag(String),

    #[error("key {0:?} has an empty identifier")]
    EmptyIdentifier(String),
}

/// Resource class encoded in a key's tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Session liveness flag; its end cascades to the session's documents
    SessionHeader,
    /// Flag for a document's set of derived blob objects
    S3Key,
    /// Flag for a single blob object
    S3File,
    /// Flag for a plain keyed-store entry
    RedisKey,
    /// Flag for vector-index entries
    ChromaDbKey,
    /// Session to documents association set
    SessionFiles,
    /// Document to blob objects set
    DocumentBlobs,
    /// Document to owning session
    DocumentOwner,
}

impl Tag {
    pub const ALL: [Tag; 8] = [
        Tag::SessionHeader,
        Tag::S3Key,
        Tag::S3File,
        Tag::RedisKey,
        Tag::ChromaDbKey,
        Tag::SessionFiles,
        Tag::DocumentBlobs,
        Tag::DocumentOwner,
    ];

    /// Wire name of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::SessionHeader => "SessionHeader",
            Tag::S3Key => "S3Key",
            Tag::S3File => "S3_File",
            Tag::RedisKey => "RedisKey",
            Tag::ChromaDbKey => "ChromaDBKey",
            Tag::SessionFiles => "Session_Files",
            Tag::DocumentBlobs => "Document_Blobs",
            Tag::DocumentOwner => "Document_Owner",
        }
    }

    /// Look up a tag by wire name. `None` for tags this service does not own.
    pub fn from_wire(name: &str) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| tag.as_str() == name)
    }

    /// Namespace prefix for keys carrying this tag, separator included
    pub fn prefix(&self) -> String {
        format!("{}{}", self.as_str(), SEPARATOR)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A well-formed key with a known tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedKey {
    tag: Tag,
    identifier: String,
}

impl TaggedKey {
    /// Build a tagged key, validating the identifier
    pub fn new(tag: Tag, identifier: impl Into<String>) -> Result<Self, KeyError> {
        let identifier = identifier.into();
        validate_identifier(&identifier)?;
        Ok(Self { tag, identifier })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl fmt::Display for TaggedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.tag, SEPARATOR, self.identifier)
    }
}

/// Result of parsing a well-formed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Known(TaggedKey),
    /// Well-formed, but the tag belongs to someone else
    Unknown { tag: String, identifier: String },
}

/// Split a key payload into tag and identifier
pub fn parse(payload: &str) -> Result<ParsedKey, KeyError> {
    let (tag, identifier) = payload
        .split_once(SEPARATOR)
        .ok_or_else(|| KeyError::MissingSeparator(payload.to_string()))?;

    if identifier.contains(SEPARATOR) {
        return Err(KeyError::ExtraSeparator(payload.to_string()));
    }
    if tag.is_empty() {
        return Err(KeyError::EmptyTag(payload.to_string()));
    }
    if identifier.is_empty() {
        return Err(KeyError::EmptyIdentifier(payload.to_string()));
    }

    Ok(match Tag::from_wire(tag) {
        Some(tag) => ParsedKey::Known(TaggedKey {
            tag,
            identifier: identifier.to_string(),
        }),
        None => ParsedKey::Unknown {
            tag: tag.to_string(),
            identifier: identifier.to_string(),
        },
    })
}

/// Check that an identifier can be embedded in a tagged key
pub fn validate_identifier(identifier: &str) -> Result<(), KeyError> {
    if identifier.is_empty() {
        return Err(KeyError::EmptyIdentifier(identifier.to_string()));
    }
    if identifier.contains(SEPARATOR) {
        return Err(KeyError::ExtraSeparator(identifier.to_string()));
    }
    Ok(())
}
