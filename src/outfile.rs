//! Write sink for the timeline and for file-backed diagnostics.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug)]
enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

/// An output file that is gzip-compressed iff its name ends in `.gz`.
///
/// Not internally synchronized; the timeline variant is only ever written
/// from the sampler thread.
#[derive(Debug)]
pub struct Outfile {
    filename: String,
    sink: Sink,
}

impl Outfile {
    /// Open `path` for writing, compressing when the suffix asks for it.
    pub fn create(path: &str) -> Result<Outfile> {
        let file = File::create(path).map_err(|source| Error::OpenOutfile {
            path: path.to_owned(),
            source,
        })?;
        let writer = BufWriter::new(file);
        let sink = if path.ends_with(".gz") {
            Sink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };
        Ok(Outfile {
            filename: path.to_owned(),
            sink,
        })
    }

    /// Open a randomly named compressed file in the current directory.
    pub fn random() -> Result<Outfile> {
        Self::create(&random_filename())
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Flush buffered output and, for compressed files, write the gzip
    /// trailer. Must be called before the file is considered complete.
    pub fn finish(self) -> Result<()> {
        match self.sink {
            Sink::Plain(mut writer) => writer.flush()?,
            Sink::Gzip(encoder) => {
                encoder.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

impl Write for Outfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Sink::Plain(writer) => writer.write(buf),
            Sink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Plain(writer) => writer.flush(),
            Sink::Gzip(encoder) => encoder.flush(),
        }
    }
}

pub(crate) fn random_filename() -> String {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("mem-scope-track.{tag}.gz")
}
