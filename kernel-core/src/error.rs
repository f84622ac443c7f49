//! The crate-wide error enum.
//!
//! Every fallible boundary in the buffer cache, file system, and virtual
//! memory layer returns `Result<T, KernelError>`. The one exception is the
//! "internal assertion" error class (dirty-without-occupied, a magic-number
//! mismatch, `deny_write_count` exceeding `open_count`): those are bugs, not
//! runtime conditions, and are reported with `assert!`/`unreachable!` instead.

/// Errors that can occur while servicing a kernel operation.
///
/// Mirrors the POSIX `errno` space closely enough that [`KernelError::into_isize`]
/// can hand a syscall dispatcher the conventional negative return value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO error. (EIO)
    IOError,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// The file system is corrupted; `&'static str` names the invariant that broke.
    FilesystemCorrupted(&'static str),
    /// Operation is not supported.
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the error into the conventional negative `isize` a syscall
    /// returns to user space.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_negative() {
        assert_eq!(KernelError::NoSuchEntry.into_isize(), -2);
        assert_eq!(KernelError::NoSpace.into_isize(), -28);
        assert!(KernelError::FilesystemCorrupted("magic").into_isize() < 0);
    }
}
