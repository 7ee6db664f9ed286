//! Tessera library -- S3-compatible multipart upload engine.
//!
//! This crate provides the pieces of an S3 multipart upload path: bucket and
//! object name validation, MD5 and composite ETag computation, an in-memory
//! registry of open uploads, the upload engine itself, pluggable storage
//! backends, and an authenticated RPC client for the gateway backend.

pub mod checksum;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod multipart;
pub mod naming;
pub mod rpc;
pub mod storage;
