// error.rs - Error types for the dispatcher, broker and configuration.

use relay_core::{ErrorClass, ParseError};
use relay_metadata::MetadataError;
use relay_registry::RegistryError;
use relay_workflow::TriggerError;
use thiserror::Error;

/// Errors raised by a message broker connection.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The topic filter is not a valid MQTT filter.
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    /// The client could not reach the broker or lost the connection.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker handle was shut down.
    #[error("broker closed")]
    Closed,
}

/// Errors that can occur while running the relay.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The relay is stopping and no longer accepts work.
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::Parse(e) => e.class(),
            DispatchError::Metadata(e) => e.class(),
            DispatchError::Trigger(e) => e.class(),
            DispatchError::Registry(e) => e.class(),
            DispatchError::Broker(BrokerError::Connection(_)) => ErrorClass::TransientDependency,
            DispatchError::ShuttingDown => ErrorClass::TransientDependency,
            DispatchError::Broker(_) | DispatchError::Config(_) | DispatchError::IoError { .. } => {
                ErrorClass::PermanentDependency
            }
        }
    }
}
