// Macros (must be first for visibility)
#[macro_use]
pub mod macros;

pub mod common;
pub mod config;
pub mod error;
pub mod groups;
pub mod kubernetes;
pub mod prom;
pub mod resolver;

pub use common::ResctrlInfo;
pub use config::Config;
pub use error::{ErrorKind, MultiError, RdtError, Result};
pub use groups::{CtrlGroup, MonGroup, RdtControl, ResctrlGroup};
pub use kubernetes::container_class;
pub use prom::RdtMetricExporter;
pub use resolver::{resolve, ResolvedConfig, ROOT_CLASS_NAME};
