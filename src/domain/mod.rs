//! Domain Layer
//!
//! Replication entities, value objects, errors, ports and pure services.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod services;
pub mod value_objects;
