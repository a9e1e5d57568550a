//! Artwork extraction service
//!
//! Turns an uploaded photo into a print-ready, background-free PNG through
//! an asynchronous job pipeline: the API server creates jobs and serves
//! their status, and workers run each job through generative recreation,
//! background removal and print normalization behind per-dependency
//! circuit breakers.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
