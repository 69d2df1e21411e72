use core::fmt;

use fullfat::{FatError, FatErrorKind};
use sdcard::CardError;

/// Errors as the rest of the system sees them. Storage errors are only
/// translated into this at the filesystem and device boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BtError {
    NotFound,
    Exists,
    AccessDenied,
    IsADirectory,
    NotADirectory,
    NotEmpty,
    NoSpace,
    Busy,
    InvalidArgument,
    Io,
    NoDevice,
}

impl From<FatError> for BtError {
    fn from(err: FatError) -> Self {
        match err.kind() {
            FatErrorKind::FileNotFound | FatErrorKind::SourceNotFound => Self::NotFound,
            FatErrorKind::ObjectExists | FatErrorKind::DestinationExists => Self::Exists,
            FatErrorKind::FileIsReadOnly
            | FatErrorKind::NotOpenedInReadMode
            | FatErrorKind::NotOpenedInWriteMode => Self::AccessDenied,
            FatErrorKind::ObjectIsADir => Self::IsADirectory,
            FatErrorKind::NotADirectory => Self::NotADirectory,
            FatErrorKind::DirNotEmpty => Self::NotEmpty,
            FatErrorKind::NoFreeClusters
            | FatErrorKind::DirectoryFull
            | FatErrorKind::CantExtendRootDir
            | FatErrorKind::FileTooLarge => Self::NoSpace,
            FatErrorKind::FileAlreadyOpen | FatErrorKind::ActiveHandles | FatErrorKind::TooManyOpenFiles => {
                Self::Busy
            }
            FatErrorKind::InvalidPath
            | FatErrorKind::InvalidName
            | FatErrorKind::NameTooLong
            | FatErrorKind::InvalidSeek
            | FatErrorKind::InvalidMode
            | FatErrorKind::BadHandle
            | FatErrorKind::InvalidFormatGeometry => Self::InvalidArgument,
            FatErrorKind::MediaRemoved => Self::NoDevice,
            FatErrorKind::DeviceDriverFailed
            | FatErrorKind::NotFatFormatted
            | FatErrorKind::InvalidBootSector
            | FatErrorKind::UnsupportedSectorSize(_)
            | FatErrorKind::InvalidCluster(_)
            | FatErrorKind::CorruptChain
            | FatErrorKind::EndOfDir => Self::Io,
        }
    }
}

impl From<CardError> for BtError {
    fn from(err: CardError) -> Self {
        match err {
            CardError::NoCard | CardError::NotReady => Self::NoDevice,
            CardError::Misaligned(_) => Self::InvalidArgument,
            CardError::Timeout(_)
            | CardError::Bus(_)
            | CardError::Protocol { .. }
            | CardError::UnsupportedCard
            | CardError::BadResponse(_) => Self::Io,
        }
    }
}

impl fmt::Display for BtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "not found",
            Self::Exists => "already exists",
            Self::AccessDenied => "access denied",
            Self::IsADirectory => "is a directory",
            Self::NotADirectory => "not a directory",
            Self::NotEmpty => "directory not empty",
            Self::NoSpace => "no space left",
            Self::Busy => "resource busy",
            Self::InvalidArgument => "invalid argument",
            Self::Io => "i/o error",
            Self::NoDevice => "no such device",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use fullfat::FatOp;

    use super::*;

    #[test]
    fn filesystem_kinds_collapse_to_os_errors() {
        let cases = [
            (FatErrorKind::FileAlreadyOpen, BtError::Busy),
            (FatErrorKind::FileIsReadOnly, BtError::AccessDenied),
            (FatErrorKind::ObjectIsADir, BtError::IsADirectory),
            (FatErrorKind::ObjectExists, BtError::Exists),
            (FatErrorKind::DirectoryFull, BtError::NoSpace),
            (FatErrorKind::NoFreeClusters, BtError::NoSpace),
            (FatErrorKind::DeviceDriverFailed, BtError::Io),
        ];
        for (kind, expected) in cases {
            assert_eq!(BtError::from(FatError::new(kind, FatOp::Open)), expected);
        }
    }

    #[test]
    fn missing_cards_read_as_absent_devices() {
        assert_eq!(BtError::from(CardError::NoCard), BtError::NoDevice);
        assert_eq!(BtError::from(CardError::Timeout(18)), BtError::Io);
    }
}
