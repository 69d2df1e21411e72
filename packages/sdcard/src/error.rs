use core::fmt;

/// Failure reported by a host controller while moving a command or data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostError {
    /// No response within the host's poll budget.
    Timeout,
    /// The underlying bus or a control pin failed.
    Bus,
    /// A data block started with something other than the start token.
    DataToken(u8),
    /// The card refused a written block.
    WriteRejected(u8),
    /// The card answered with error bits instead of starting a data phase.
    Status(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardError {
    Timeout(u8),
    NoCard,
    NotReady,
    Bus(u8),
    Protocol { cmd: u8, status: u32 },
    UnsupportedCard,
    BadResponse(u8),
    Misaligned(usize),
}

impl CardError {
    /// Attaches the command that was in flight to a host failure.
    pub fn from_host(cmd: u8, error: HostError) -> Self {
        match error {
            HostError::Timeout => Self::Timeout(cmd),
            HostError::Bus => Self::Bus(cmd),
            HostError::DataToken(token) => Self::Protocol {
                cmd,
                status: token as u32,
            },
            HostError::WriteRejected(response) | HostError::Status(response) => Self::Protocol {
                cmd,
                status: response as u32,
            },
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl fmt::Display for CardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(cmd) => write!(f, "CMD{} timed out", cmd),
            Self::NoCard => f.write_str("no card present"),
            Self::NotReady => f.write_str("card not initialised"),
            Self::Bus(cmd) => write!(f, "bus failure during CMD{}", cmd),
            Self::Protocol { cmd, status } => write!(f, "CMD{} status={:#010x}", cmd, status),
            Self::UnsupportedCard => f.write_str("unsupported card"),
            Self::BadResponse(cmd) => write!(f, "bad response to CMD{}", cmd),
            Self::Misaligned(len) => write!(f, "buffer of {} bytes is not block aligned", len),
        }
    }
}
