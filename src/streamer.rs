//! Job output multiplexing.
//!
//! An action's stdout and stderr are spooled into one file of
//! length-prefixed records: `<stream-id:u8><length:u32-be><payload>`.
//! Stream ids are 1 for stdout and 2 for stderr. Per-stream byte order
//! is preserved; the two streams interleave only at record boundaries,
//! so concatenating payloads per id is canonical.
//!
//! A zero-id, zero-length record terminates the spool file. This marker
//! is a detail of the file format (it lets a follower distinguish "job
//! still writing" from "job done") and is not part of the record wire
//! format itself.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stream id for stdout records.
pub const STREAM_STDOUT: u8 = 1;
/// Stream id for stderr records.
pub const STREAM_STDERR: u8 = 2;
/// Internal terminator id.
const STREAM_END: u8 = 0;

// =============================================================================
// Mux (write side)
// =============================================================================

/// Writer side of a spooled stream multiplex.
///
/// Cloneable appenders serialize whole records under one lock, so
/// records never tear even when stdout and stderr pump concurrently.
pub struct StreamMux {
    file: Arc<Mutex<File>>,
}

impl StreamMux {
    /// Creates the spool file, truncating any previous content.
    pub fn create(path: &Path) -> io::Result<StreamMux> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(StreamMux {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Returns an appender writing records tagged with `stream_id`.
    pub fn appender(&self, stream_id: u8) -> StreamAppender {
        StreamAppender {
            file: Arc::clone(&self.file),
            stream_id,
        }
    }

    /// Writes the end-of-streams marker. Call exactly once, after all
    /// appenders are done.
    pub fn close(&self) -> io::Result<()> {
        let mut file = self.file.lock().expect("stream mux lock poisoned");
        write_record(&mut *file, STREAM_END, &[])?;
        file.flush()
    }
}

/// An appender for one stream id. Each `write` emits one record.
#[derive(Clone)]
pub struct StreamAppender {
    file: Arc<Mutex<File>>,
    stream_id: u8,
}

impl Write for StreamAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut file = self.file.lock().expect("stream mux lock poisoned");
        write_record(&mut *file, self.stream_id, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().expect("stream mux lock poisoned").flush()
    }
}

fn write_record(w: &mut impl Write, stream_id: u8, payload: &[u8]) -> io::Result<()> {
    w.write_all(&[stream_id])?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)
}

// =============================================================================
// Demux (read side)
// =============================================================================

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub stream_id: u8,
    pub payload: Vec<u8>,
}

/// Decodes all records from a fully-written spool, stopping at the
/// terminator (or clean EOF for spools written by other producers).
pub fn demux(mut r: impl Read) -> io::Result<Vec<StreamRecord>> {
    let mut records = Vec::new();
    loop {
        match read_record(&mut r)? {
            None => break,
            Some(rec) if rec.stream_id == STREAM_END => break,
            Some(rec) => records.push(rec),
        }
    }
    Ok(records)
}

/// Follows a spool file as it is written, copying stdout records to
/// `out` and stderr records to `err`. Returns once the terminator
/// record is observed.
///
/// A reader can observe a record mid-write, so every partial read seeks
/// back to the record boundary before retrying.
pub fn follow(path: &Path, out: &mut impl Write, err: &mut impl Write) -> io::Result<()> {
    use std::io::Seek;

    let mut file = File::open(path)?;
    loop {
        let record_start = file.stream_position()?;
        match read_record(&mut file) {
            Ok(Some(rec)) if rec.stream_id == STREAM_END => return Ok(()),
            Ok(Some(rec)) => match rec.stream_id {
                STREAM_STDOUT => out.write_all(&rec.payload)?,
                STREAM_STDERR => err.write_all(&rec.payload)?,
                _ => {}
            },
            // Writer has not caught up; back off briefly and retry from
            // the boundary.
            Ok(None) => {
                file.seek(io::SeekFrom::Start(record_start))?;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                file.seek(io::SeekFrom::Start(record_start))?;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reads one record; None on clean EOF at a record boundary.
fn read_record(r: &mut impl Read) -> io::Result<Option<StreamRecord>> {
    let mut id = [0u8; 1];
    match r.read_exact(&mut id) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(StreamRecord {
        stream_id: id[0],
        payload,
    }))
}

/// Concatenates the payloads of one stream id from a record list.
pub fn concat_stream(records: &[StreamRecord], stream_id: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    for rec in records {
        if rec.stream_id == stream_id {
            buf.extend_from_slice(&rec.payload);
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_round_trip_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mux = StreamMux::create(&path).unwrap();
        let mut out = mux.appender(STREAM_STDOUT);
        let mut err = mux.appender(STREAM_STDERR);

        out.write_all(b"hello ").unwrap();
        err.write_all(b"oops").unwrap();
        out.write_all(b"world").unwrap();
        mux.close().unwrap();

        let records = demux(File::open(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(concat_stream(&records, STREAM_STDOUT), b"hello world");
        assert_eq!(concat_stream(&records, STREAM_STDERR), b"oops");
    }

    #[test]
    fn follow_returns_at_terminator() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mux = StreamMux::create(&path).unwrap();
        mux.appender(STREAM_STDOUT).write_all(b"x").unwrap();
        mux.close().unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        follow(&path, &mut out, &mut err).unwrap();
        assert_eq!(out, b"x");
        assert!(err.is_empty());
    }

    #[test]
    fn empty_write_emits_no_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mux = StreamMux::create(&path).unwrap();
        mux.appender(STREAM_STDOUT).write_all(b"").unwrap();
        mux.close().unwrap();
        let records = demux(File::open(&path).unwrap()).unwrap();
        assert!(records.is_empty());
    }
}
