pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("resource error on device {device}: {message}")]
    Resource { device: usize, message: String },

    #[error("bytecode buffer overflow: program exceeds {limit} bytes, increase max bytecode size")]
    Encoding { limit: usize },

    #[error("malformed bytecode at offset {offset}: {message}")]
    Decode { offset: usize, message: String },

    #[error("device error on device {device}, event {event}: {message}")]
    Device {
        device: usize,
        event: u64,
        message: String,
    },

    #[error("instruction {index} ({opcode}): {source}")]
    Instruction {
        index: usize,
        opcode: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn resource<S: Into<String>>(device: usize, msg: S) -> Self {
        Error::Resource {
            device,
            message: msg.into(),
        }
    }

    pub fn encoding(limit: usize) -> Self {
        Error::Encoding { limit }
    }

    pub fn decode<S: Into<String>>(offset: usize, msg: S) -> Self {
        Error::Decode {
            offset,
            message: msg.into(),
        }
    }

    pub fn device<S: Into<String>>(device: usize, event: u64, msg: S) -> Self {
        Error::Device {
            device,
            event,
            message: msg.into(),
        }
    }

    /// Attach the failing instruction to an error raised while interpreting it.
    pub fn at_instruction(self, index: usize, opcode: &'static str) -> Self {
        match self {
            already @ Error::Instruction { .. } => already,
            other => Error::Instruction {
                index,
                opcode,
                source: Box::new(other),
            },
        }
    }

    /// Only an overflowing program can be fixed by retrying (with a larger
    /// bytecode budget); everything else is fatal for the current context.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Encoding { .. } => true,
            Error::Instruction { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// The innermost error, skipping instruction context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Instruction { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_context_is_not_nested() {
        let err = Error::config("generated code is null")
            .at_instruction(3, "LAUNCH")
            .at_instruction(9, "END");

        match &err {
            Error::Instruction { index, opcode, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(*opcode, "LAUNCH");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(err.root(), Error::Config(_)));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::encoding(4096).is_recoverable());
        assert!(Error::encoding(4096).at_instruction(1, "LAUNCH").is_recoverable());
        assert!(!Error::resource(0, "out of memory").is_recoverable());
        assert!(!Error::config("multiple contexts").is_recoverable());
    }

    #[test]
    fn test_messages() {
        let msg = Error::encoding(64).to_string();
        assert!(msg.contains("increase max bytecode size"));

        let msg = Error::resource(1, "out of memory").to_string();
        assert!(msg.contains("device 1"));
    }
}
