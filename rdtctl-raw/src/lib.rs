//! # rdtctl-raw
//!
//! Low-level building blocks for Intel RDT control through the Linux resctrl
//! pseudo-filesystem.
//!
//! This crate provides the cache capacity [`Bitmask`] value type with its
//! textual codecs, the integer list parser used for cache ID selectors, and
//! the [`ResctrlFs`] filesystem abstraction. Resolution of allocation
//! requests and group management live in `rdtctl`.
//!
//! ## Usage
//!
//! ```ignore
//! use rdtctl_raw::{Bitmask, LocalFs, ResctrlFs};
//! use std::path::Path;
//!
//! let fs = LocalFs::new("/sys/fs/resctrl");
//! let mask = Bitmask::from_list_str("0-7")?;
//!
//! fs.write(Path::new("grp/schemata"), format!("L3:0={mask:x}\n").as_bytes())?;
//! ```

pub mod bitmask;
pub mod fs;
pub mod list;

// Re-export for convenience
pub use bitmask::{Bitmask, BitmaskError};
pub use fs::{last_cmd_status, LocalFs, ResctrlFs, LAST_CMD_STATUS};
pub use list::parse_int_list;
