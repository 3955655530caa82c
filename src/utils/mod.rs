mod timer;
pub mod timing;
mod wait;

pub use timer::*;
pub use wait::*;

/// Number of `unit`-sized pieces needed to cover `total`; never less than one.
pub const fn units_of(total: usize, unit: usize) -> usize {
    if total == 0 || unit == 0 {
        1
    } else {
        total.div_ceil(unit)
    }
}
