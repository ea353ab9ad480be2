use thiserror::Error;

/// Failures while decoding a request frame from the engine pipe.
///
/// The two variants map one-to-one onto the ack sentinels: a malformed or
/// size-inconsistent frame is answered with `ERROR_MESSAGE_DATA`, an unknown
/// discriminant with `ERROR_MESSAGE_TYPE`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unknown message type {0}")]
    UnknownType(u32),
}

impl DecodeError {
    /// The sentinel carried in the ack for this failure.
    pub fn ack_code(&self) -> u32 {
        match self {
            DecodeError::Malformed(_) => crate::constants::ERROR_MESSAGE_DATA,
            DecodeError::UnknownType(_) => crate::constants::ERROR_MESSAGE_TYPE,
        }
    }
}

/// Failures while splitting the client startup blob into its three strings.
/// All of them are answered with `ERROR_STARTUP_DATA` and end the session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StartupDataError {
    #[error("startup data is not NUL terminated")]
    NotTerminated,

    #[error("startup data ends at the working directory")]
    MissingOptions,

    #[error("startup data ends at the command line options")]
    MissingStdin,

    #[error("startup data is empty")]
    Empty,
}
