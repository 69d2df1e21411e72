use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatErrorKind {
    DeviceDriverFailed,
    NotFatFormatted,
    InvalidBootSector,
    UnsupportedSectorSize(u16),
    ActiveHandles,
    InvalidCluster(u32),
    CorruptChain,
    NoFreeClusters,
    CantExtendRootDir,
    DirectoryFull,
    EndOfDir,
    ObjectExists,
    DirNotEmpty,
    NotADirectory,
    InvalidPath,
    InvalidName,
    NameTooLong,
    FileNotFound,
    FileAlreadyOpen,
    FileTooLarge,
    NotOpenedInReadMode,
    NotOpenedInWriteMode,
    FileIsReadOnly,
    ObjectIsADir,
    DestinationExists,
    SourceNotFound,
    InvalidSeek,
    InvalidMode,
    MediaRemoved,
    BadHandle,
    TooManyOpenFiles,
    InvalidFormatGeometry,
}

impl FatErrorKind {
    pub(crate) const fn at(self, op: FatOp) -> FatError {
        FatError { kind: self, op }
    }
}

/// Where an error was first raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatOp {
    Mount,
    Unmount,
    Flush,
    BlockRead,
    BlockWrite,
    GetEntry,
    PutEntry,
    FindFreeCluster,
    CreateClusterChain,
    ExtendChain,
    UnlinkChain,
    CountFreeClusters,
    Traverse,
    ExtendDirectory,
    FindDir,
    FindEntryInDir,
    FindNext,
    FindFreeDirent,
    CreateShortName,
    CreateDirent,
    MkDir,
    Open,
    Close,
    Read,
    Write,
    Seek,
    ExtendFile,
    RmFile,
    RmDir,
    Move,
    SetTime,
    CheckValid,
    Format,
}

/// A base error kind tagged with the operation that raised it.
///
/// Errors pass upward unchanged through `?`, so the tag names the innermost
/// operation that failed rather than the public call that was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatError {
    kind: FatErrorKind,
    op: FatOp,
}

impl FatError {
    pub const fn new(kind: FatErrorKind, op: FatOp) -> Self {
        Self { kind, op }
    }

    pub const fn kind(&self) -> FatErrorKind {
        self.kind
    }

    pub const fn op(&self) -> FatOp {
        self.op
    }

    pub fn is(&self, kind: FatErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {:?}", self.kind, self.op)
    }
}
