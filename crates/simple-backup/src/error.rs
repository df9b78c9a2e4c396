use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    OutputInvalid,
    PermissionDenied,
    NotFound,
    Auth,
    Remote,
    Other,
}

impl ErrorKind {
    // Process exit codes; 4 (copy engine failure) is an outcome, not an error.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config | ErrorKind::NotFound | ErrorKind::Other => 1,
            ErrorKind::OutputInvalid => 2,
            ErrorKind::PermissionDenied => 3,
            ErrorKind::Auth | ErrorKind::Remote => 5,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn output_invalid<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::OutputInvalid, msg)
    }

    pub fn permission_denied<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn auth<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Auth, msg)
    }

    pub fn remote<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Remote, msg)
    }

    // Wrap an io error with context while keeping its kind.
    pub fn io(context: impl fmt::Display, err: io::Error) -> Self {
        let kind = kind_of_io(&err);
        Self::new(kind, format!("{context}: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

fn kind_of_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::Other,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(kind_of_io(&err), err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::remote(format!("ssh: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
