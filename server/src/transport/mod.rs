//! Network transports: TCP line protocol and HTTP ingestion

pub mod http;
pub mod tcp;
