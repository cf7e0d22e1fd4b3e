use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of initial sequence numbers for relayed TCP connections
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::rng().next_u32()
    }
}
