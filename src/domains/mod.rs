pub mod envelope;
pub mod rpc;
