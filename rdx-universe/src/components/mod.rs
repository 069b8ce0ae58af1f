//! Building blocks the universe's tick loop is assembled from.

pub(crate) mod bands;
pub mod event;
pub(crate) mod registry;
