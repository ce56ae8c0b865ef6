pub mod storage;
pub mod transport;
pub mod wallet;
