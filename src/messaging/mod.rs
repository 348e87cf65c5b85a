//! # Messaging Module
//!
//! Job model and wire codecs shared by the publish path and the delivery loop.

pub mod codec;
pub mod job;

pub use codec::{codec_for, decode, DecodeDefaults, JobCodec, PlainCodec, StructuredCodec};
pub use job::{Acknowledger, Item, Job, JobOptions};
