use std::fmt;

#[derive(Debug)]
pub enum Error {
	/// An error from the underlying file system or pipe.
	Io(std::io::Error),
	/// The segment or one of its structures is inconsistent. Mutating the
	/// segment after this error is undefined; the shard process terminates.
	Corruption(String),
	/// The caller supplied something the engine cannot store or parse.
	InvalidInput(String),
	/// The shard subprocess exited while requests were outstanding.
	ShardDied(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(e) => write!(f, "IO Error: {}", e),
			Error::Corruption(e) => write!(f, "Corruption: {}", e),
			Error::InvalidInput(e) => write!(f, "Invalid input: {}", e),
			Error::ShardDied(e) => write!(f, "Shard died: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}
