//! SIRI Vehicle Monitoring (SIRI-VM) support
//!
//! - [`parser`]: XML document -> [`ParsedRecord`]s, fields kept as published
//! - [`validator`]: [`ParsedRecord`] -> [`VehicleLocation`](sirivm_common::VehicleLocation)

pub mod parser;
pub mod validator;

pub use parser::{ParseError, ParsedRecord, RecordParser, SiriVmParser};
pub use validator::{RecordValidator, SiriVmValidator, ValidationError};
