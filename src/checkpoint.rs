//! Checkpoints of a paused cluster.
//!
//! Every structure that survives a save implements [`Checkpoint`] against the
//! [`Writer`] and [`Reader`] visitors. The visitors only see named values and
//! byte strings, so the layout of a snapshot on disk is decided here alone:
//! one file per node holding the fields in order, archived with rkyv,
//! compressed with zstd and prefixed by the blake3 digest of the compressed
//! bytes.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tracing::debug;

use crate::{
    block::AccessMode,
    error::Error,
    id::{GlobalId, NodeId},
};

const DIGEST_LEN: usize = 32;
const ZSTD_LEVEL: i32 = 3;

pub trait Writer {
    fn write_value(&mut self, name: &'static str, value: u64);

    fn write_bytes(&mut self, name: &'static str, data: &[u8]);

    /// A nested structure, preceded by a marker carrying its name.
    fn write_object<T: Checkpoint>(&mut self, name: &'static str, object: &T)
    where
        Self: Sized,
    {
        self.write_value(name, 0);
        object.save(self);
    }

    /// A length followed by every item.
    fn write_sequence<'a, T, I>(&mut self, name: &'static str, items: I)
    where
        Self: Sized,
        T: Checkpoint + 'a,
        I: IntoIterator<Item = &'a T>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        self.write_value(name, items.len() as u64);
        for item in items {
            item.save(self);
        }
    }
}

pub trait Reader {
    fn read_value(&mut self, name: &'static str) -> Result<u64, Error>;

    fn read_bytes(&mut self, name: &'static str) -> Result<Vec<u8>, Error>;

    fn read_object<T: Checkpoint>(&mut self, name: &'static str) -> Result<T, Error>
    where
        Self: Sized,
    {
        self.read_value(name)?;
        T::load(self)
    }

    fn read_sequence<T: Checkpoint>(&mut self, name: &'static str) -> Result<Vec<T>, Error>
    where
        Self: Sized,
    {
        let count = self.read_value(name)?;
        (0..count).map(|_| T::load(self)).collect()
    }

    fn read_bool(&mut self, name: &'static str) -> Result<bool, Error>
    where
        Self: Sized,
    {
        Ok(self.read_value(name)? != 0)
    }

    fn read_u32(&mut self, name: &'static str) -> Result<u32, Error>
    where
        Self: Sized,
    {
        u32::try_from(self.read_value(name)?)
            .map_err(|_| Error::Checkpoint(format!("{} does not fit 32 bits", name)))
    }
}

/// A structure that can be written to and rebuilt from a checkpoint.
pub trait Checkpoint: Sized {
    fn save<W: Writer>(&self, w: &mut W);

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error>;
}

impl Checkpoint for u64 {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("value", *self);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        r.read_value("value")
    }
}

impl Checkpoint for u32 {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("value", u64::from(*self));
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        r.read_u32("value")
    }
}

impl Checkpoint for GlobalId {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("id", self.as_u64());
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(GlobalId::from_u64(r.read_value("id")?))
    }
}

impl Checkpoint for AccessMode {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_value("mode", *self as u64);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        AccessMode::try_from(r.read_value("mode")? as u8)
    }
}

impl<A: Checkpoint, B: Checkpoint> Checkpoint for (A, B) {
    fn save<W: Writer>(&self, w: &mut W) {
        self.0.save(w);
        self.1.save(w);
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok((A::load(r)?, B::load(r)?))
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Field {
    Value { name: String, value: u64 },
    Bytes { name: String, data: Vec<u8> },
}

/// Everything one node wrote during a save.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Snapshot {
    pub node: NodeId,
    pub node_count: u32,
    /// Microseconds since the epoch.
    pub taken_at: i64,
    pub fields: Vec<Field>,
}

impl Snapshot {
    pub fn new(node: NodeId, node_count: u32) -> Self {
        Self { node, node_count, taken_at: Utc::now().timestamp_micros(), fields: Vec::new() }
    }

    pub fn reader(&self) -> SnapshotReader<'_> {
        SnapshotReader { fields: self.fields.iter() }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let archived = rkyv::to_bytes::<_, 1024>(self)
            .map_err(|_| Error::Checkpoint("archive failed".into()))?;
        let compressed = zstd::encode_all(archived.as_slice(), ZSTD_LEVEL)?;
        let mut bytes = Vec::with_capacity(DIGEST_LEN + compressed.len());
        bytes.extend_from_slice(blake3::hash(&compressed).as_bytes());
        bytes.extend_from_slice(&compressed);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < DIGEST_LEN {
            return Err(Error::Checkpoint("file too short".into()));
        }
        let (digest, compressed) = bytes.split_at(DIGEST_LEN);
        if blake3::hash(compressed).as_bytes() != digest {
            return Err(Error::ChecksumMismatch);
        }
        let archived = zstd::decode_all(compressed)?;
        let mut aligned = AlignedVec::with_capacity(archived.len());
        aligned.extend_from_slice(&archived);
        rkyv::from_bytes::<Snapshot>(&aligned)
            .map_err(|_| Error::Checkpoint("invalid snapshot".into()))
    }

    /// Where node `node` keeps its snapshot under `dir`.
    pub fn path(dir: &Path, node: NodeId) -> PathBuf {
        dir.join(format!("p{}", node))
    }

    pub fn write_file(&self, dir: &Path) -> Result<PathBuf, Error> {
        fs::create_dir_all(dir)?;
        let path = Self::path(dir, self.node);
        let bytes = self.to_bytes()?;
        fs::write(&path, &bytes)?;
        debug!(node = self.node, fields = self.fields.len(), bytes = bytes.len(), "checkpoint written");
        Ok(path)
    }

    pub fn read_file(dir: &Path, node: NodeId) -> Result<Self, Error> {
        let snapshot = Self::from_bytes(&fs::read(Self::path(dir, node))?)?;
        if snapshot.node != node {
            return Err(Error::Checkpoint(format!(
                "snapshot of node {} found in place of node {}",
                snapshot.node, node
            )));
        }
        Ok(snapshot)
    }
}

impl Writer for Snapshot {
    fn write_value(&mut self, name: &'static str, value: u64) {
        self.fields.push(Field::Value { name: name.to_owned(), value });
    }

    fn write_bytes(&mut self, name: &'static str, data: &[u8]) {
        self.fields.push(Field::Bytes { name: name.to_owned(), data: data.to_vec() });
    }
}

/// Reads a snapshot's fields back in the order they were written.
pub struct SnapshotReader<'a> {
    fields: std::slice::Iter<'a, Field>,
}

impl SnapshotReader<'_> {
    fn next(&mut self, name: &'static str) -> Result<&Field, Error> {
        self.fields
            .next()
            .ok_or_else(|| Error::Checkpoint(format!("snapshot ended before {}", name)))
    }

    pub fn is_done(&self) -> bool {
        self.fields.len() == 0
    }
}

impl Reader for SnapshotReader<'_> {
    fn read_value(&mut self, name: &'static str) -> Result<u64, Error> {
        match self.next(name)? {
            Field::Value { name: found, value } if found == name => Ok(*value),
            other => Err(mismatch(name, other)),
        }
    }

    fn read_bytes(&mut self, name: &'static str) -> Result<Vec<u8>, Error> {
        match self.next(name)? {
            Field::Bytes { name: found, data } if found == name => Ok(data.clone()),
            other => Err(mismatch(name, other)),
        }
    }
}

fn mismatch(expected: &str, found: &Field) -> Error {
    let found = match found {
        Field::Value { name, .. } | Field::Bytes { name, .. } => name,
    };
    Error::Checkpoint(format!("expected {}, found {}", expected, found))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        id: GlobalId,
        tags: Vec<u32>,
        blob: Vec<u8>,
    }

    impl Checkpoint for Pair {
        fn save<W: Writer>(&self, w: &mut W) {
            self.id.save(w);
            w.write_sequence("tags", &self.tags);
            w.write_bytes("blob", &self.blob);
        }

        fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
            Ok(Self {
                id: GlobalId::load(r)?,
                tags: r.read_sequence("tags")?,
                blob: r.read_bytes("blob")?,
            })
        }
    }

    fn pair() -> Pair {
        Pair { id: GlobalId::direct(2, 9), tags: vec![4, 5, 6], blob: b"contents".to_vec() }
    }

    #[test]
    fn test_snapshot_survives_disk() {
        let dir = std::env::temp_dir().join(format!("weft-checkpoint-{}", std::process::id()));
        let mut snapshot = Snapshot::new(1, 3);
        snapshot.write_object("pair", &pair());
        snapshot.write_value("sequence", 77);
        snapshot.write_file(&dir).unwrap();

        let loaded = Snapshot::read_file(&dir, 1).unwrap();
        assert_eq!(loaded, snapshot);
        let mut r = loaded.reader();
        assert_eq!(r.read_object::<Pair>("pair").unwrap(), pair());
        assert_eq!(r.read_value("sequence").unwrap(), 77);
        assert!(r.is_done());
        assert!(Snapshot::read_file(&dir, 0).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut snapshot = Snapshot::new(0, 1);
        snapshot.write_value("x", 1);
        let mut bytes = snapshot.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(Snapshot::from_bytes(&bytes), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_reader_checks_field_names() {
        let mut snapshot = Snapshot::new(0, 1);
        snapshot.write_value("a", 1);
        let mut r = snapshot.reader();
        assert!(matches!(r.read_value("b"), Err(Error::Checkpoint(_))));
        assert!(matches!(r.read_value("c"), Err(Error::Checkpoint(_))));
    }
}
