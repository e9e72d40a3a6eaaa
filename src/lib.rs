//! Conversion of TCZYX microscopy images into chunked, multiscale OME-Zarr.
//!
//! A [`convert::ConversionJob`] reads a source one time batch at a time through an
//! [`source::ImageReader`], writes every pyramid level of each scene with a
//! [`pyramid::PyramidWriter`] and finishes each group with OME-NGFF metadata.
//! [`batch::BatchOrchestrator`] runs many such jobs from a list, a directory or a CSV file.
pub mod batch;
pub mod chunk;
pub mod cli;
pub mod codec;
pub mod convert;
pub mod dtype;
mod error;
pub mod metadata;
pub mod options;
pub mod pyramid;
pub mod scale;
pub mod source;
pub mod storage;

pub use zarrs;

pub use error::{BatchCoords, Error, Result};
