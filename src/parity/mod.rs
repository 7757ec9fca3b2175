//! PAR2 parity handling
//!
//! The core abstraction is the [`ParityHandler`] trait. Two implementations
//! ship with the crate:
//!
//! - [`CliParityHandler`]: drives the external `par2` binary
//! - [`NoOpParityHandler`]: stub used when no binary is available
//!
//! [`layout`] owns the `.parity` directory convention, including the
//! suffix guard every deletion goes through.
//!
//! ## Usage
//!
//! ```no_run
//! use par2_protect::parity::{CliParityHandler, ExecutionContext, ParityHandler, ParityLayout};
//! use par2_protect::types::OperationId;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = CliParityHandler::from_path().expect("par2 binary not found");
//!     let layout = ParityLayout::detect(Path::new("/mnt/user/photos"))?;
//!
//!     let report = handler
//!         .verify(&layout, ExecutionContext::new(OperationId::generate()))
//!         .await?;
//!     if !report.is_complete() && report.repairable {
//!         println!("{} damaged files can be repaired", report.damaged_files.len());
//!     }
//!     Ok(())
//! }
//! ```

mod cli;
pub mod layout;
mod noop;
pub mod parser;
mod traits;

pub use cli::CliParityHandler;
pub use layout::{PARITY_DIR_NAME, ParityLayout, SourceFiles, check_parity_location};
pub use noop::NoOpParityHandler;
pub use parser::Par2Exit;
pub use traits::{
    CreateOutcome, ExecutionContext, ParityCapabilities, ParityHandler, RepairResult, VerifyReport,
};
