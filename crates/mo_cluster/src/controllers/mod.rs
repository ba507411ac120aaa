pub mod bucketclaim;
pub mod cnclaim;
pub mod cnpool;
pub mod cnset;
pub mod cnstore;
pub mod common;
pub mod logset;
