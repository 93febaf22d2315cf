//! HTTP API: router service, request/response mapping and process wiring.

pub mod app;
