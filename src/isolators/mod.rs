//! Isolator implementations.
//!
//! Each isolator enforces one dimension of a container. Isolators are
//! selected by name from [`crate::ContainerizerFlags::isolation`].

pub mod posix;

pub use self::posix::PosixIsolator;

use crate::constants::POSIX_ISOLATOR;
use crate::error::{Error, Result};
use crate::isolator::Isolator;
use std::sync::Arc;

/// Builds the isolators named in `names`, in order.
pub fn from_names(names: &[String]) -> Result<Vec<Arc<dyn Isolator>>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            POSIX_ISOLATOR => Ok(Arc::new(PosixIsolator::new()) as Arc<dyn Isolator>),
            other => Err(Error::InvalidConfig(format!("unknown isolator '{other}'"))),
        })
        .collect()
}
