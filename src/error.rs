use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open memory statistics output file `{path}`: {source}")]
    OpenOutfile { path: String, source: io::Error },

    #[error("cannot write memory timeline: {0}")]
    WriteTimeline(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
