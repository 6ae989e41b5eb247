use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::protocol::instruction::{Inbound, Outbound};

/// Field separator of the text wire format.
pub const SEPARATOR: char = ',';

/// A single protocol message: an instruction followed by its arguments.
///
/// On the wire a message is one datagram of the form
/// `INSTRUCTION,arg1,arg2,...`. Arguments are not escaped, so an argument
/// must never contain [`SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    instruction: String,
    arguments: Vec<String>,
}

impl Message {
    pub fn new(instruction: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            instruction: instruction.into(),
            arguments,
        }
    }

    /// Start an outbound message with no arguments.
    pub fn outbound(instruction: Outbound) -> Self {
        Self::new(instruction.as_str(), Vec::new())
    }

    pub fn with_arg(mut self, argument: impl ToString) -> Self {
        self.arguments.push(argument.to_string());
        self
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn argument(&self, index: usize) -> Option<&str> {
        self.arguments.get(index).map(String::as_str)
    }

    /// Serialize to the text wire format.
    pub fn encode(&self) -> String {
        let mut out = self.instruction.clone();
        for arg in &self.arguments {
            out.push(SEPARATOR);
            out.push_str(arg);
        }
        out
    }

    /// Decode a received datagram.
    ///
    /// Trailing NUL padding and line terminators are stripped, as is whitespace
    /// around the instruction. Arguments are kept verbatim. The instruction is
    /// not checked against any instruction set here; see [`Message::inbound_instruction`].
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
        text.parse()
    }

    pub fn inbound_instruction(&self) -> Result<Inbound, ProtocolError> {
        self.instruction.parse()
    }

    /// Fail unless at least `expected` arguments are present.
    pub fn require_args(
        &self,
        instruction: &'static str,
        expected: usize,
    ) -> Result<(), ProtocolError> {
        if self.arguments.len() < expected {
            return Err(ProtocolError::MissingArgument {
                instruction,
                expected,
                actual: self.arguments.len(),
            });
        }
        Ok(())
    }

    /// Parse the argument at `index` into `T`.
    pub fn parse_arg<T: FromStr>(&self, index: usize, name: &'static str) -> Result<T, ProtocolError> {
        let raw = self.argument(index).unwrap_or_default();
        raw.trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidArgument {
                name,
                value: raw.to_string(),
            })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim_end_matches(['\0', '\r', '\n']);
        let mut fields = text.split(SEPARATOR);
        let instruction = fields.next().unwrap_or_default().trim();
        if instruction.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(Self {
            instruction: instruction.to_string(),
            arguments: fields.map(str::to_string).collect(),
        })
    }
}
