//! Snapshot stream.
//!
//! Layout:
//! ```text
//! [magic "MSNP"][version: u32 LE][zlib body][sha256 of the zlib body: 32]
//! body := [table count: u8] { [table id: u8][entries: u64 LE]
//!                             { [klen: u32 LE][key][vlen: u32 LE][value] } }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use redb::Database;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::ReadableTableMetadata;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use super::read_applied_index;
use super::AppliedIndex;
use super::BytesTable;
use super::ALL_TABLES;
use super::RAFT_META;
use crate::constants::SNAPSHOT_CHECKSUM_LEN;
use crate::constants::SNAPSHOT_MAGIC;
use crate::constants::SNAPSHOT_VERSION;
use crate::Result;
use crate::StorageError;

const HEADER_LEN: u64 = 8;

fn snapshot_error(msg: impl Into<String>) -> StorageError {
    StorageError::Snapshot(msg.into())
}

/// Point-in-time view of the store.
pub struct StoreSnapshot {
    tx: ReadTransaction,
    applied: AppliedIndex,
}

impl StoreSnapshot {
    pub(crate) fn new(tx: ReadTransaction) -> Result<Self> {
        let applied = {
            let table = tx.open_table(RAFT_META)?;
            read_applied_index(&table)?
        };
        Ok(Self { tx, applied })
    }

    pub fn applied(&self) -> AppliedIndex {
        self.applied
    }

    /// Streams the full store content into `sink`.
    pub fn persist<W: Write>(
        &self,
        sink: W,
    ) -> Result<()> {
        let mut sink = sink;
        sink.write_all(SNAPSHOT_MAGIC)?;
        sink.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;

        let mut hashing = HashingWriter::new(sink);
        {
            let mut encoder = ZlibEncoder::new(&mut hashing, Compression::default());
            encoder.write_all(&[ALL_TABLES.len() as u8])?;
            for (id, def) in ALL_TABLES {
                let table = self.tx.open_table(def)?;
                encoder.write_all(&[id])?;
                encoder.write_all(&table.len()?.to_le_bytes())?;
                for item in table.iter()? {
                    let (k, v) = item?;
                    write_chunk(&mut encoder, k.value())?;
                    write_chunk(&mut encoder, v.value())?;
                }
            }
            encoder.finish()?;
        }
        let (mut sink, digest) = hashing.finalize();
        sink.write_all(&digest)?;
        sink.flush()?;

        debug!(index = self.applied.index, "snapshot persisted");
        Ok(())
    }
}

fn write_chunk<W: Write>(
    w: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(data)
}

fn read_chunk<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Copies the incoming stream to `path` and syncs it.
pub(crate) fn spool_snapshot<R: Read>(
    mut reader: R,
    path: &Path,
) -> Result<u64> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    let n = std::io::copy(&mut reader, &mut w)?;
    let file = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(n)
}

/// Verifies the spooled snapshot and writes its content into `db`.
pub(crate) fn load_snapshot(
    spool: &Path,
    db: &Database,
) -> Result<()> {
    let mut file = File::open(spool)?;
    let total = file.metadata()?.len();
    if total < HEADER_LEN + SNAPSHOT_CHECKSUM_LEN as u64 {
        return Err(snapshot_error(format!("snapshot too short: {} bytes", total)).into());
    }

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    if &header[..4] != SNAPSHOT_MAGIC {
        return Err(snapshot_error("bad magic").into());
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(snapshot_error(format!("unsupported version {}", version)).into());
    }

    let body_len = total - HEADER_LEN - SNAPSHOT_CHECKSUM_LEN as u64;
    let mut hashing = HashingWriter::new(std::io::sink());
    std::io::copy(&mut (&mut file).take(body_len), &mut hashing)?;
    let (_, digest) = hashing.finalize();
    let mut expected = [0u8; SNAPSHOT_CHECKSUM_LEN];
    file.read_exact(&mut expected)?;
    if digest != expected {
        return Err(snapshot_error("checksum mismatch").into());
    }

    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut decoder = ZlibDecoder::new(BufReader::new(file.take(body_len)));

    let tx = db.begin_write()?;
    let mut count = [0u8; 1];
    decoder.read_exact(&mut count)?;
    for _ in 0..count[0] {
        let mut id = [0u8; 1];
        decoder.read_exact(&mut id)?;
        let def = table_by_id(id[0])?;
        let mut n = [0u8; 8];
        decoder.read_exact(&mut n)?;
        let n = u64::from_le_bytes(n);

        let mut table = tx.open_table(def)?;
        for _ in 0..n {
            let k = read_chunk(&mut decoder)?;
            let v = read_chunk(&mut decoder)?;
            table.insert(k.as_slice(), v.as_slice())?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn table_by_id(id: u8) -> Result<BytesTable> {
    ALL_TABLES
        .iter()
        .find(|(tid, _)| *tid == id)
        .map(|(_, def)| *def)
        .ok_or_else(|| snapshot_error(format!("unknown table id {}", id)).into())
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize(self) -> (W, [u8; SNAPSHOT_CHECKSUM_LEN]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
