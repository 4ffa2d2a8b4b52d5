pub(crate) mod bitmap;
pub(crate) mod data_structures;
pub(crate) mod error;
pub(crate) mod hostlist;
pub(crate) mod ids;
pub(crate) mod index;
pub(crate) mod sync;
pub(crate) mod timeutils;

pub use data_structures::{Map, Set};
