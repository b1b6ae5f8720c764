//! Structured log messages generated during analysis.
//!
//! Warnings that must survive as part of the analysis output are collected as
//! [`LogMessage`] objects attached to the function under decompilation. They
//! are distinct from the `log` crate records the library also emits, which are
//! meant for the developer console.

use crate::address::Address;
use crate::prelude::*;

use std::fmt::{self, Display};

/// A message logged during analysis, optionally anchored to an address.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct LogMessage {
    /// The log message.
    pub text: String,
    /// The severity/type of the log message.
    pub level: LogLevel,
    /// The address in the analyzed program that the message is about.
    pub location: Option<Address>,
    /// The analysis stage that generated the message.
    pub source: Option<String>,
}

impl LogMessage {
    /// Returns a new info-level log message.
    pub fn new_info(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Info,
            location: None,
            source: None,
        }
    }

    /// Returns a new debug-level log message.
    pub fn new_debug(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Debug,
            location: None,
            source: None,
        }
    }

    /// Returns a new error-level log message.
    pub fn new_error(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Error,
            location: None,
            source: None,
        }
    }

    /// Sets the address that the message is about.
    pub fn location(mut self, addr: Address) -> LogMessage {
        self.location = Some(addr);
        self
    }

    /// Sets the analysis stage that generated the message.
    pub fn source(mut self, source: impl Into<String>) -> LogMessage {
        self.source = Some(source.into());
        self
    }
}

/// The severity/type of a log message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum LogLevel {
    /// Messages useful for debugging.
    Debug,
    /// Errors encountered during analysis.
    Error,
    /// Messages intended for the user.
    Info,
}

impl Display for LogMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self.level {
            LogLevel::Debug => write!(formatter, "DEBUG: ")?,
            LogLevel::Error => write!(formatter, "ERROR: ")?,
            LogLevel::Info => write!(formatter, "INFO: ")?,
        };
        if let Some(source) = &self.source {
            write!(formatter, "{}: ", source)?;
        }
        if let Some(location) = &self.location {
            write!(formatter, "{}: ", location)?;
        }
        write!(formatter, "{}", self.text)
    }
}

/// Print all provided log messages to stdout.
pub fn print_all_messages(logs: &[LogMessage]) {
    for log in logs {
        println!("{}", log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_location() {
        let msg = LogMessage::new_error("jump table recovery failed")
            .location(Address::invalid())
            .source("flow");
        assert!(format!("{}", msg).starts_with("ERROR: flow:"));
    }
}
