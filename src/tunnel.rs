pub mod bridge;
pub mod correlator;
pub mod gateway;
pub mod relay;

#[cfg(test)]
pub(crate) mod testutil;
