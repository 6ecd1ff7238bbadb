//! Keel operator: runs the Application controller

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod cli;
/// Controller construction
pub mod controller_runner;
/// Application CRD rendering and installation
pub mod crds;
