pub mod background_removal;
pub mod capability;
pub mod circuit_breaker;
pub mod generative;
pub mod health_registry;
pub mod job_service;
pub mod normalizer;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod status;
pub mod storage;
pub mod worker_pool;
