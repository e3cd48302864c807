// ABOUTME: Chunk artifact encoding and decoding
// ABOUTME: Hashing/gzip writer chain, COPY-to-INSERT script conversion, and verified reads

use crate::error::{Result, TransferError};
use crate::sql::{insert_header, quote_literal};
use crate::transfer::types::TableDescriptor;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Suffix of an artifact that is still being written
pub const PARTIAL_SUFFIX: &str = "part";

const READ_BLOCK: usize = 64 * 1024;

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Writer that hashes and counts everything passing through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn into_parts(self) -> (W, u64, String) {
        (self.inner, self.bytes, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// File sink for one artifact, optionally gzip-compressed
pub enum ArtifactEncoder {
    Plain(HashingWriter<BufWriter<File>>),
    Gzip(GzEncoder<HashingWriter<BufWriter<File>>>),
}

impl ArtifactEncoder {
    /// Create (truncating) `path`; `level` enables gzip at that level
    pub fn create(path: &Path, level: Option<u32>) -> io::Result<Self> {
        let file = HashingWriter::new(BufWriter::new(File::create(path)?));
        Ok(match level {
            Some(level) => Self::Gzip(GzEncoder::new(file, Compression::new(level.min(9)))),
            None => Self::Plain(file),
        })
    }

    /// Finish the stream and fsync, returning bytes on disk and their SHA-256
    pub fn finish(self) -> io::Result<(u64, String)> {
        let hashing = match self {
            Self::Plain(w) => w,
            Self::Gzip(enc) => enc.finish()?,
        };
        let (buffered, bytes, checksum) = hashing.into_parts();
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((bytes, checksum))
    }
}

impl Write for ArtifactEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

/// Pass-through writer counting COPY text rows (one per newline)
pub struct RowCounter<W> {
    inner: W,
    rows: u64,
}

impl<W: Write> RowCounter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, rows: 0 }
    }

    pub fn into_parts(self) -> (W, u64) {
        (self.inner, self.rows)
    }
}

impl<W: Write> Write for RowCounter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.rows += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Converts a COPY text stream into a replayable INSERT script
///
/// Rows are grouped into multi-row `INSERT` statements of `batch_size`
/// rows. With `transactional` the script is wrapped in `BEGIN;`/`COMMIT;`.
pub struct InsertScriptWriter<W: Write> {
    inner: W,
    header: String,
    batch_size: usize,
    transactional: bool,
    line: Vec<u8>,
    batch: Vec<String>,
    rows: u64,
}

impl<W: Write> InsertScriptWriter<W> {
    pub fn new(
        mut inner: W,
        table: &TableDescriptor,
        chunk_index: u32,
        batch_size: usize,
        transactional: bool,
    ) -> io::Result<Self> {
        writeln!(inner, "-- {}.{} chunk {}", table.schema, table.name, chunk_index)?;
        writeln!(inner, "SET standard_conforming_strings = on;")?;
        if transactional {
            writeln!(inner, "BEGIN;")?;
        }
        writeln!(inner)?;

        Ok(Self {
            inner,
            header: insert_header(table),
            batch_size: batch_size.max(1),
            transactional,
            line: Vec::new(),
            batch: Vec::new(),
            rows: 0,
        })
    }

    /// Flush buffered rows and close the transaction, returning the sink and row count
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.push_row(&line)?;
        }
        self.flush_batch()?;
        if self.transactional {
            writeln!(self.inner, "COMMIT;")?;
        }
        Ok((self.inner, self.rows))
    }

    fn push_row(&mut self, line: &[u8]) -> io::Result<()> {
        let values: Vec<String> = line
            .split(|b| *b == b'\t')
            .map(|field| match decode_copy_field(field) {
                Some(text) => quote_literal(&text),
                None => "NULL".to_string(),
            })
            .collect();
        self.batch.push(format!("  ({})", values.join(", ")));
        self.rows += 1;

        if self.batch.len() >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> io::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        writeln!(self.inner, "{}", self.header)?;
        writeln!(self.inner, "{};", self.batch.join(",\n"))?;
        writeln!(self.inner)?;
        self.batch.clear();
        Ok(())
    }
}

impl<W: Write> Write for InsertScriptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.line.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.line);
            self.push_row(&line)?;
            rest = &rest[pos + 1..];
        }
        self.line.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// How COPY text is laid out inside an artifact file
#[derive(Debug, Clone)]
pub enum ArtifactLayout {
    Copy,
    Insert {
        table: TableDescriptor,
        chunk_index: u32,
        batch_size: usize,
        transactional: bool,
    },
}

/// COPY text in, encoded artifact out
pub trait RowPipeline: Write + Send {
    /// Flush trailing output, returning the encoder and the rows seen
    fn finish_rows(self: Box<Self>) -> io::Result<(ArtifactEncoder, u64)>;
}

impl RowPipeline for RowCounter<ArtifactEncoder> {
    fn finish_rows(self: Box<Self>) -> io::Result<(ArtifactEncoder, u64)> {
        Ok(self.into_parts())
    }
}

impl RowPipeline for InsertScriptWriter<ArtifactEncoder> {
    fn finish_rows(self: Box<Self>) -> io::Result<(ArtifactEncoder, u64)> {
        (*self).finish()
    }
}

/// Create `path` and the writer chain for `layout`
pub fn open_pipeline(
    path: &Path,
    level: Option<u32>,
    layout: ArtifactLayout,
) -> io::Result<Box<dyn RowPipeline>> {
    let encoder = ArtifactEncoder::create(path, level)?;
    Ok(match layout {
        ArtifactLayout::Copy => Box::new(RowCounter::new(encoder)),
        ArtifactLayout::Insert {
            table,
            chunk_index,
            batch_size,
            transactional,
        } => Box::new(InsertScriptWriter::new(
            encoder,
            &table,
            chunk_index,
            batch_size,
            transactional,
        )?),
    })
}

/// Decode one COPY text-format field; `None` for `\N`
pub fn decode_copy_field(raw: &[u8]) -> Option<String> {
    if raw == b"\\N" {
        return None;
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != b'\\' || i + 1 == raw.len() {
            out.push(b);
            i += 1;
            continue;
        }

        let next = raw[i + 1];
        i += 2;
        match next {
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut digits = 1;
                while digits < 3 && i < raw.len() && (b'0'..=b'7').contains(&raw[i]) {
                    value = value * 8 + u32::from(raw[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push(value as u8);
            }
            b'x' if i < raw.len() && raw[i].is_ascii_hexdigit() => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 && i < raw.len() && raw[i].is_ascii_hexdigit() {
                    value = value * 16 + (raw[i] as char).to_digit(16).unwrap_or(0);
                    i += 1;
                    digits += 1;
                }
                out.push(value as u8);
            }
            other => out.push(other),
        }
    }

    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Check an artifact on disk against the checksum recorded at dump time
///
/// The file is hashed in fixed-size blocks. A missing file or a mismatch is
/// fatal: retrying cannot repair it.
pub fn verify_artifact(path: &Path, expected_checksum: Option<&str>) -> Result<()> {
    let mut file = File::open(path).map_err(|e| unreadable(path, e))?;
    let Some(expected) = expected_checksum else {
        return Ok(());
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BLOCK];
    loop {
        let n = file.read(&mut buf).map_err(|e| unreadable(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if actual != expected {
        return Err(TransferError::Fatal(format!(
            "artifact {} is corrupt: checksum {} does not match manifest {}",
            path.display(),
            actual,
            expected
        )));
    }
    Ok(())
}

/// Decode an artifact block by block, passing each block to `emit`
///
/// Stops early, without error, when `emit` returns false.
pub fn decode_artifact(
    path: &Path,
    compressed: bool,
    mut emit: impl FnMut(Bytes) -> bool,
) -> Result<()> {
    let file = BufReader::new(File::open(path).map_err(|e| unreadable(path, e))?);
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut buf = vec![0u8; READ_BLOCK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if compressed => {
                return Err(TransferError::Fatal(format!(
                    "artifact {} is corrupt: gzip stream unreadable: {}",
                    path.display(),
                    e
                )))
            }
            Err(e) => return Err(unreadable(path, e)),
        };
        if n == 0 || !emit(Bytes::copy_from_slice(&buf[..n])) {
            return Ok(());
        }
    }
}

fn unreadable(path: &Path, e: io::Error) -> TransferError {
    TransferError::Fatal(format!("cannot read artifact {}: {}", path.display(), e))
}
