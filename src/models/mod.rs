pub mod asset;
pub mod extraction;
pub mod job;
