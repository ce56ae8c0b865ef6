pub mod bridge;
pub mod messenger;
pub mod pending;
pub mod pipeline;
pub mod provider;
pub mod transport;
pub mod window;
