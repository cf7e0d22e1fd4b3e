pub mod hexdump;
pub mod random;
pub mod safe_converter;
