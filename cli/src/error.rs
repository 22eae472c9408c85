use std::{fmt::Display, io};

use dfu_host::{DfuError, TransportError};

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    Transport(TransportError),
    NoDFUDevice,
    ManyDFUDevices,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl From<TransportError> for CliError {
    fn from(value: TransportError) -> Self {
        CliError::Transport(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::Transport(err) => write!(f, "USB error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU device"),
        }
    }
}
