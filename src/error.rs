//! Crate-wide error type.
//!
//! Follows the taxonomy every public operation reports against: an invalid
//! argument fails fast, a miss is represented by `Option`/`NotFound` rather
//! than an error, and everything else (I/O, SQL, encoding) is wrapped here so
//! callers see one type regardless of which tier produced it.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid input: {reason}"))]
    InvalidInput { reason: String },

    #[snafu(display("not found"))]
    NotFound,

    #[snafu(display("io error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("db error: {source}"))]
    Db { source: rusqlite::Error },

    #[snafu(display("encoding error: {reason}"))]
    Encoding { reason: String },
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(source: rusqlite::Error) -> Self {
        Self::Db { source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this is the "expected" miss case rather than an operational failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
