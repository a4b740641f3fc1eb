//! LTC6804-2 multicell battery monitors.
//!
//! A [`ChipPack`] describes which cells are wired to a chip, the [`Ltc6804Adapter`] fills its
//! readings over an [`AddressableBus`](crate::bus::AddressableBus).

mod adapter;
mod chip_pack;
pub mod protocol;

pub use adapter::Ltc6804Adapter;
pub use chip_pack::{ChipPack, CHANNELS};
