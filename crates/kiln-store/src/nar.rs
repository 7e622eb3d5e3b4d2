//! NAR archives.
//!
//! A NAR is the canonical serialization of a store path's file tree, used to
//! move paths between stores. Kiln frames members in a simple length-prefixed
//! layout; the member listing is recovered after a build for log indexing
//! without unpacking the archive to disk.

use crate::error::{StoreError, StoreResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8] = b"kiln-nar-1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NarMemberKind {
    Directory,
    Regular,
    Executable,
    Symlink,
}

/// One entry of a NAR member listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarMember {
    pub path: String,
    pub kind: NarMemberKind,
    pub size: u64,
}

/// A serialized store path.
#[derive(Debug, Clone)]
pub struct Nar(Bytes);

impl Nar {
    /// Serialize a file tree given as `(path, kind, contents)` triples.
    /// Directory and symlink members carry their target in `contents`.
    pub fn from_members<I>(members: I) -> Self
    where
        I: IntoIterator<Item = (String, NarMemberKind, Bytes)>,
    {
        let mut buf = BytesMut::from(MAGIC);
        for (path, kind, contents) in members {
            buf.put_u8(match kind {
                NarMemberKind::Directory => 0,
                NarMemberKind::Regular => 1,
                NarMemberKind::Executable => 2,
                NarMemberKind::Symlink => 3,
            });
            buf.put_u32(path.len() as u32);
            buf.put_slice(path.as_bytes());
            buf.put_u64(contents.len() as u64);
            buf.put_slice(&contents);
        }
        Self(buf.freeze())
    }

    /// Serialize a single regular file.
    pub fn from_contents(contents: impl Into<Bytes>) -> Self {
        Self::from_members([(String::new(), NarMemberKind::Regular, contents.into())])
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn size(&self) -> u64 {
        self.0.len() as u64
    }

    /// Walk the archive and return its member listing.
    pub fn members(&self) -> StoreResult<Vec<NarMember>> {
        let mut buf = self.0.clone();
        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(StoreError::MalformedNar("bad magic".into()));
        }
        buf.advance(MAGIC.len());

        let mut members = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 1 + 4 {
                return Err(StoreError::MalformedNar("truncated header".into()));
            }
            let kind = match buf.get_u8() {
                0 => NarMemberKind::Directory,
                1 => NarMemberKind::Regular,
                2 => NarMemberKind::Executable,
                3 => NarMemberKind::Symlink,
                k => return Err(StoreError::MalformedNar(format!("unknown kind {k}"))),
            };
            let path_len = buf.get_u32() as usize;
            if buf.remaining() < path_len + 8 {
                return Err(StoreError::MalformedNar("truncated path".into()));
            }
            let path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())
                .map_err(|_| StoreError::MalformedNar("non-utf8 path".into()))?;
            let size = buf.get_u64();
            if (buf.remaining() as u64) < size {
                return Err(StoreError::MalformedNar("truncated contents".into()));
            }
            buf.advance(size as usize);
            members.push(NarMember { path, kind, size });
        }
        Ok(members)
    }
}
