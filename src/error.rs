pub type Result<T> = core::result::Result<T, self::Error>;

/// Errors
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    BadMagic,
    NotDir,
    IsDir,
    NotFound,
    Exist,
    InvalidParam,
    NoSpace,
    StaleReference,
    NameTooLong,
    OpNotSupported,
    IoError,
}
