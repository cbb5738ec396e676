//! Shared building blocks of `stackops`.
//!
//! - [`document`]: loading and rendering template documents
//! - [`pointer`], [`patch`]: structural patch sets over templates
//! - [`overrides`]: the older dotted-path override rules
//! - [`text_patch`]: splicing text into a serialized template that we do not own
//! - [`stack_api`]: the interface to the remote stack service

pub mod document;
pub mod overrides;
pub mod patch;
pub mod pointer;
pub mod stack_api;
pub mod text_patch;
