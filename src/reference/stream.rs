//! Stream references for pipelines reading from stdin or writing to stdout

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared reader handle
pub type SharedReader = Arc<Mutex<Box<dyn Read + Send>>>;
/// Shared writer handle
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A stream location; two streams are equal when they share handles
#[derive(Clone)]
pub struct StreamReference {
    pub reader: Option<SharedReader>,
    pub writer: Option<SharedWriter>,
}

impl StreamReference {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Some(Arc::new(Mutex::new(Box::new(reader)))),
            writer: None,
        }
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: None,
            writer: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    /// Read the whole input stream
    pub fn read_to_string(&self) -> std::io::Result<String> {
        let mut out = String::new();
        if let Some(reader) = &self.reader {
            reader.lock().read_to_string(&mut out)?;
        }
        Ok(out)
    }

    /// Write to the output stream
    pub fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        match &self.writer {
            Some(writer) => writer.lock().write_all(bytes),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "stream has no writer",
            )),
        }
    }
}

impl std::fmt::Debug for StreamReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReference")
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

impl PartialEq for StreamReference {
    fn eq(&self, other: &Self) -> bool {
        let same_reader = match (&self.reader, &other.reader) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let same_writer = match (&self.writer, &other.writer) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_reader && same_writer
    }
}

impl Eq for StreamReference {}
