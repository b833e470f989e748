//! # I/O Module
//!
//! Persistence of volumes, error traces and summaries.
//!
//! Volumes use one generic binary array format: a `bincode` encoding of an `ndarray` array,
//! which records the element type, the shape and the elements in logical order. The
//! [`traits::ArrayFile`] trait gives every serializable array `read_from_path` and
//! `write_to_path`; [`binary`] implements it together with the text and TOML helpers used by
//! the reconstruction outputs.

pub mod binary;
pub mod traits;

pub use binary::{ArrayIoError, load_dataset, read_toml, write_errors_text, write_toml};
pub use traits::ArrayFile;
