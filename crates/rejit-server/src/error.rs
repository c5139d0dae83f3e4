//! Server error types.

use std::fmt;

use rejit_proto::ProtocolError;

use crate::pipeline::CodeGenError;

/// Errors that end a server session.
///
/// Decode and lift failures are *not* here: those are reported to the
/// client in-band as empty objects and the session continues.
#[derive(Debug)]
pub enum ServerError {
    /// The client asked for a guest architecture the server cannot lift.
    ///
    /// Fatal at init, before the session becomes usable.
    UnsupportedArch(u32),

    /// Framing or transport failure on the connection.
    ///
    /// There is no mid-session resync; the connection is torn down.
    Protocol(ProtocolError),

    /// The compiler backend failed to lower the module.
    CodeGen(CodeGenError),

    /// Fork handoff plumbing failed (socketpair, sendmsg).
    Fork(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArch(machine) => {
                write!(f, "unsupported guest architecture (EM value {machine})")
            },
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::CodeGen(err) => write!(f, "codegen error: {err}"),
            Self::Fork(err) => write!(f, "fork handoff failed: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(err) => Some(err),
            Self::CodeGen(err) => Some(err),
            Self::Fork(err) => Some(err),
            Self::UnsupportedArch(_) => None,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<CodeGenError> for ServerError {
    fn from(err: CodeGenError) -> Self {
        Self::CodeGen(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Protocol(ProtocolError::Io(err))
    }
}
