use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Instructions the dispatcher accepts from controllers and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inbound {
    RegController,
    RegNode,
    NewJob,
    FinJob,
    NewJobSuccess,
    NewJobFailure,
    AckIsAlive,
    GetInfo,
    StopSystem,
}

impl Inbound {
    pub const ALL: [Inbound; 9] = [
        Inbound::RegController,
        Inbound::RegNode,
        Inbound::NewJob,
        Inbound::FinJob,
        Inbound::NewJobSuccess,
        Inbound::NewJobFailure,
        Inbound::AckIsAlive,
        Inbound::GetInfo,
        Inbound::StopSystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Inbound::RegController => "REG_CONTROLLER",
            Inbound::RegNode => "REG_NODE",
            Inbound::NewJob => "NEW_JOB",
            Inbound::FinJob => "FIN_JOB",
            Inbound::NewJobSuccess => "NEW_JOB_SUCCESS",
            Inbound::NewJobFailure => "NEW_JOB_FAILURE",
            Inbound::AckIsAlive => "ACK_IS_ALIVE",
            Inbound::GetInfo => "GET_INFO",
            Inbound::StopSystem => "STOP_SYSTEM",
        }
    }
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Inbound {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Inbound::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownInstruction(s.to_string()))
    }
}

/// Instructions the dispatcher sends to controllers and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outbound {
    RegSuccess,
    RegFailure,
    IsAlive,
    NewJob,
    StopNode,
    FinJob,
    NewJobSuccess,
    NewJobFailure,
    Info,
    StopController,
}

impl Outbound {
    pub const ALL: [Outbound; 10] = [
        Outbound::RegSuccess,
        Outbound::RegFailure,
        Outbound::IsAlive,
        Outbound::NewJob,
        Outbound::StopNode,
        Outbound::FinJob,
        Outbound::NewJobSuccess,
        Outbound::NewJobFailure,
        Outbound::Info,
        Outbound::StopController,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outbound::RegSuccess => "REG_SUCCESS",
            Outbound::RegFailure => "REG_FAILURE",
            Outbound::IsAlive => "IS_ALIVE",
            Outbound::NewJob => "NEW_JOB",
            Outbound::StopNode => "STOP_NODE",
            Outbound::FinJob => "FIN_JOB",
            Outbound::NewJobSuccess => "NEW_JOB_SUCCESS",
            Outbound::NewJobFailure => "NEW_JOB_FAILURE",
            Outbound::Info => "INFO",
            Outbound::StopController => "STOP_CONTROLLER",
        }
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outbound {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outbound::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownInstruction(s.to_string()))
    }
}
