pub mod annotate;
pub mod append;
pub mod build;
pub mod config;
pub mod constants;
pub mod error;
pub mod layer;
pub mod logging;
pub mod multiarch;
pub mod oci;
pub mod pushed;
pub mod source;

pub use error::{LayerstackError, Result};
